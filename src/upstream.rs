//! Thin, rate-limited wrapper around the external catalog API (spec §2
//! component 2, §6 "External interfaces"). Out of scope per spec §1 is
//! the upstream service itself; this module only adapts its HTTP shape
//! to typed records and serializes calls through the shared governor.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::governor::RateGovernor;
use crate::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Upstream's `user` and `text` fields are tolerated as either a
/// structured object or a raw JSON-encoded scalar (spec §6, §9 design
/// note: "parse into a sum type").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum User {
    Structured { name: String, id: serde_json::Value },
    Raw(String),
}

impl User {
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            User::Structured { name, .. } => name,
            User::Raw(s) => s,
        }
    }
}

/// A free-text upstream field (e.g. tick `text`) that may arrive as a
/// JSON-encoded scalar or as a structured object (spec §6, §9 design
/// note).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpaqueText {
    Structured(serde_json::Value),
    Raw(String),
}

impl OpaqueText {
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            OpaqueText::Raw(s) => s.clone(),
            OpaqueText::Structured(v) => v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamChild {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub route_types: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct RouteTypeCounts {
    total: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamArea {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// `[lon, lat]`, upstream's ordering (spec §6).
    pub coordinates: Option<(f64, f64)>,
    route_type_counts: RouteTypeCounts,
    pub children: Vec<UpstreamChild>,
}

impl UpstreamArea {
    /// Latitude/longitude in `(lat, lon)` order, the store's
    /// convention (spec §3: "centroid (lat, lon)").
    #[must_use]
    pub fn lat_lon(&self) -> Option<(f64, f64)> {
        self.coordinates.map(|(lon, lat)| (lat, lon))
    }

    #[must_use]
    pub fn total_route_count(&self) -> i64 {
        self.route_type_counts.total
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind.eq_ignore_ascii_case("route")
            || self.children.iter().all(|c| c.kind.eq_ignore_ascii_case("route"))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamTick {
    pub date: String,
    pub user: User,
    pub text: OpaqueText,
    pub style: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamComment {
    pub id: i64,
    pub user: User,
    pub created: i64,
    pub message: String,
}

/// The external catalog API, opaque and rate-limited (spec §1).
/// Implemented by `ReqwestUpstreamClient` for production and by an
/// in-memory fake in tests.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_area(&self, id: i64) -> Result<UpstreamArea, Error>;
    async fn fetch_ticks(&self, route_id: i64) -> Result<Vec<UpstreamTick>, Error>;
    async fn fetch_comments(&self, target: CommentFetchTarget) -> Result<Vec<UpstreamComment>, Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommentFetchTarget {
    Route(i64),
    Area(i64),
}

pub struct ReqwestUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    governor: RateGovernor,
}

impl ReqwestUpstreamClient {
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client fails to build.
    pub fn new(base_url: impl Into<String>, auth_token: Option<&str>, governor: RateGovernor) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(token) = auth_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Upstream(e.to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            governor,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.governor.acquire().await?;
            let result = self.http.get(url).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| Error::Upstream(e.to_string()));
                }
                Ok(resp) if resp.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                }
                Ok(resp) => {
                    return Err(Error::Upstream(format!(
                        "upstream returned {}",
                        resp.status()
                    )));
                }
                Err(e) if e.is_timeout() && attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(Error::Upstream(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn fetch_area(&self, id: i64) -> Result<UpstreamArea, Error> {
        let url = format!("{}/area/{id}", self.base_url);
        self.get_json(&url).await
    }

    async fn fetch_ticks(&self, route_id: i64) -> Result<Vec<UpstreamTick>, Error> {
        let url = format!("{}/ticks?route={route_id}", self.base_url);
        self.get_json(&url).await
    }

    async fn fetch_comments(&self, target: CommentFetchTarget) -> Result<Vec<UpstreamComment>, Error> {
        let url = match target {
            CommentFetchTarget::Route(id) => format!("{}/comments?route={id}", self.base_url),
            CommentFetchTarget::Area(id) => format!("{}/comments?area={id}", self.base_url),
        };
        self.get_json(&url).await
    }
}

/// Strips HTML markup and decodes entities from upstream free text
/// (spec §4.4.2: "HTML entity decode, strip a leading middot, trim").
#[must_use]
pub fn clean_text(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw);
    let stripped = strip_tags(&decoded);
    stripped
        .trim()
        .trim_start_matches('\u{b7}')
        .trim()
        .to_string()
}

fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_display_name_handles_both_shapes() {
        let structured = User::Structured {
            name: "Alex".into(),
            id: serde_json::json!(1),
        };
        let raw = User::Raw("Anonymous".into());
        assert_eq!(structured.display_name(), "Alex");
        assert_eq!(raw.display_name(), "Anonymous");
    }

    #[test]
    fn user_deserializes_from_object_or_string() {
        let from_object: User = serde_json::from_str(r#"{"name":"Pat","id":5}"#).unwrap();
        let from_string: User = serde_json::from_str(r#""Pat""#).unwrap();
        assert_eq!(from_object.display_name(), "Pat");
        assert_eq!(from_string.display_name(), "Pat");
    }

    #[test]
    fn clean_text_decodes_entities_and_strips_tags_and_middot() {
        let raw = "\u{b7} <b>Fun &amp; sunny</b>  ";
        assert_eq!(clean_text(raw), "Fun & sunny");
    }

    #[test]
    fn area_is_leaf_when_all_children_are_routes() {
        let area = UpstreamArea {
            id: 1,
            title: "Crag".into(),
            kind: "Area".into(),
            coordinates: None,
            route_type_counts: RouteTypeCounts { total: 2 },
            children: vec![
                UpstreamChild {
                    id: 10,
                    title: "R1".into(),
                    kind: "Route".into(),
                    route_types: vec!["Sport".into()],
                },
                UpstreamChild {
                    id: 11,
                    title: "R2".into(),
                    kind: "Route".into(),
                    route_types: vec!["Trad".into()],
                },
            ],
        };
        assert!(area.is_leaf());
    }

    #[test]
    fn area_lat_lon_swaps_upstream_lon_lat_ordering() {
        let area = UpstreamArea {
            id: 1,
            title: "Crag".into(),
            kind: "Area".into(),
            coordinates: Some((-105.5, 40.0)),
            route_type_counts: RouteTypeCounts { total: 0 },
            children: vec![],
        };
        assert_eq!(area.lat_lon(), Some((40.0, -105.5)));
    }
}
