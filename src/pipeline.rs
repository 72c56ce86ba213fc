//! The four coordinated sync flows (spec §4.4): recursive catalog
//! discovery, incremental tick sync, incremental comment sync, and
//! count-delta new-route discovery. Every upstream call in this module
//! goes through the shared client, which itself serializes through the
//! rate governor — no flow here sleeps directly (spec §9 design note).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    date_policy::parse_upstream_climbed_at,
    monitor::ProgressReporter,
    store::Database,
    sync_metadata::{SyncKind, SyncSelector},
    types::{Area, AreaKind, Aspect, Comment, CommentTarget, Route, RouteTypes, Tick},
    upstream::{clean_text, CommentFetchTarget, UpstreamClient},
    Error,
};

/// A cooperative cancellation flag, checked at loop heads and before
/// upstream calls (spec §5: "a context-like token").
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DiscoverySummary {
    pub new_routes: i64,
}

/// Bundles the store and upstream client the four flows share (spec
/// §9: "construct once at process init and inject").
#[derive(Clone)]
pub struct SyncPipeline {
    db: Database,
    upstream: Arc<dyn UpstreamClient>,
}

impl SyncPipeline {
    #[must_use]
    pub fn new(db: Database, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { db, upstream }
    }

    /// Breadth-first sync from a root area (spec §4.4.1). `location_id`
    /// is inherited by every area and route discovered under this root.
    ///
    /// # Errors
    ///
    /// Returns an error only for store failures that abort the whole
    /// job; per-item upstream and parse failures are recorded on
    /// `progress` and otherwise swallowed (spec §4.4.6).
    pub async fn full_sync(
        &self,
        root_area_id: i64,
        location_id: Option<i32>,
        progress: &mut ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let mut queue = std::collections::VecDeque::new();
        let mut visited = std::collections::HashSet::new();
        queue.push_back((root_area_id, None));

        while let Some((area_id, parent_area_id)) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !visited.insert(area_id) {
                continue;
            }

            let upstream_area = match self.upstream.fetch_area(area_id).await {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(area_id, error = %e, "failed to fetch area, skipping");
                    progress.record_failure(None).await?;
                    continue;
                }
            };

            let (lat, lon) = upstream_area
                .lat_lon()
                .map_or((None, None), |(lat, lon)| (Some(lat), Some(lon)));
            let area = Area {
                mp_area_id: upstream_area.id,
                name: upstream_area.title.clone(),
                parent_mp_area_id: parent_area_id,
                area_type: if upstream_area.is_leaf() {
                    AreaKind::Leaf
                } else {
                    AreaKind::Branch
                },
                location_id,
                latitude: lat,
                longitude: lon,
                last_synced_at: Some(Utc::now().naive_utc()),
                route_count: Some(upstream_area.total_route_count() as i32),
                last_checked_at: Some(Utc::now().naive_utc()),
            };
            if let Err(e) = self.db.upsert_area(&area).await {
                tracing::warn!(area_id, error = %e, "failed to upsert area, skipping");
                progress.record_failure(None).await?;
                continue;
            }
            if let Err(e) = self.sync_comments_for_area(area_id).await {
                tracing::warn!(area_id, error = %e, "area comment sync failed");
                progress.record_failure(None).await?;
            }

            let mut boulder_route_ids = Vec::new();
            for child in &upstream_area.children {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if child.kind.eq_ignore_ascii_case("route") {
                    let route_type = RouteTypes::parse(&child.route_types.join(", "));
                    let is_boulder = route_type.is_boulder();
                    let route = Route {
                        mp_route_id: child.id,
                        mp_area_id: area_id,
                        name: child.title.clone(),
                        route_type,
                        rating: None,
                        location_id,
                        latitude: None,
                        longitude: None,
                        aspect: None,
                        created_at: Utc::now().naive_utc(),
                        updated_at: Utc::now().naive_utc(),
                    };
                    if let Err(e) = self.db.upsert_route(&route).await {
                        tracing::warn!(route_id = child.id, error = %e, "failed to upsert route, skipping");
                        progress.record_failure(None).await?;
                        continue;
                    }
                    if is_boulder {
                        boulder_route_ids.push(child.id);
                    }
                    match self.sync_ticks_for_route(child.id).await {
                        Ok(_) => progress.record_success(None).await?,
                        Err(e) => {
                            tracing::warn!(route_id = child.id, error = %e, "tick sync failed");
                            progress.record_failure(None).await?;
                        }
                    }
                    if let Err(e) = self.sync_comments_for_route(child.id).await {
                        tracing::warn!(route_id = child.id, error = %e, "route comment sync failed");
                        progress.record_failure(None).await?;
                    }
                } else {
                    queue.push_back((child.id, Some(area_id)));
                }
            }

            if let (Some(lat), Some(lon)) = (lat, lon) {
                if !boulder_route_ids.is_empty() {
                    self.distribute_boulder_gps(lat, lon, &boulder_route_ids, progress).await?;
                }
            }
        }

        Ok(())
    }

    /// Assigns GPS positions to boulder routes lacking them, spaced
    /// evenly around the area centroid (spec §4.4.1 step 5). Ring
    /// radius scales with child count; this is recomputed on every
    /// sync and is not seeded deterministically (spec §9 open question
    /// 3 — flagged, not fixed, in this crate).
    async fn distribute_boulder_gps(
        &self,
        center_lat: f64,
        center_lon: f64,
        route_ids: &[i64],
        progress: &mut ProgressReporter,
    ) -> Result<(), Error> {
        let n = route_ids.len();
        for (i, &route_id) in route_ids.iter().enumerate() {
            let (lat, lon, aspect) = ring_position(center_lat, center_lon, i, n);
            if let Err(e) = self.db.update_route_gps(route_id, lat, lon, aspect).await {
                tracing::warn!(route_id, error = %e, "failed to update boulder GPS, skipping");
                progress.record_failure(None).await?;
            }
        }
        Ok(())
    }

    /// Per-route incremental tick sync (spec §4.4.2). Returns the
    /// number of new ticks inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn sync_ticks_for_route(&self, route_id: i64) -> Result<u32, Error> {
        let last_tick_at = self.db.last_tick_at(route_id).await?;
        let raw_ticks = self.upstream.fetch_ticks(route_id).await?;

        let mut inserted = 0;
        for raw in raw_ticks {
            let climbed_at = match parse_upstream_climbed_at(&raw.date) {
                Ok(dt) => dt,
                Err(e) => {
                    tracing::warn!(route_id, error = %e, "unparseable tick date, skipping");
                    continue;
                }
            };
            if last_tick_at.is_some_and(|last| climbed_at <= last) {
                continue;
            }
            let tick = Tick {
                id: 0,
                mp_route_id: route_id,
                user_name: raw.user.display_name().to_string(),
                climbed_at,
                style: Some(raw.style.clone()),
                comment: Some(clean_text(&raw.text.as_text())),
            };
            match self.db.upsert_tick(&tick).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(route_id, error = %e, "store error upserting tick"),
            }
        }
        self.db.touch_tick_sync(route_id).await?;
        Ok(inserted)
    }

    /// Per-route incremental comment sync (spec §4.4.3).
    ///
    /// # Errors
    ///
    /// Returns an error if upstream or the store is unreachable.
    pub async fn sync_comments_for_route(&self, route_id: i64) -> Result<u32, Error> {
        let raw = self
            .upstream
            .fetch_comments(CommentFetchTarget::Route(route_id))
            .await?;
        let count = self
            .upsert_comments(raw, CommentTarget::Route(route_id))
            .await?;
        self.db.touch_comment_sync(route_id).await?;
        Ok(count)
    }

    /// Area-level comment sync (spec §4.4.3, used by the full sync's
    /// step 3).
    ///
    /// # Errors
    ///
    /// Returns an error if upstream or the store is unreachable.
    pub async fn sync_comments_for_area(&self, area_id: i64) -> Result<u32, Error> {
        let raw = self
            .upstream
            .fetch_comments(CommentFetchTarget::Area(area_id))
            .await?;
        self.upsert_comments(raw, CommentTarget::Area(area_id)).await
    }

    async fn upsert_comments(
        &self,
        raw: Vec<crate::upstream::UpstreamComment>,
        target: CommentTarget,
    ) -> Result<u32, Error> {
        let mut count = 0;
        for c in raw {
            let commented_at = DateTime::from_timestamp(c.created, 0)
                .map(|dt| dt.naive_utc())
                .unwrap_or_else(|| Utc::now().naive_utc());
            let comment = Comment {
                mp_comment_id: c.id,
                target,
                user_name: c.user.display_name().to_string(),
                comment_text: clean_text(&c.message),
                commented_at,
            };
            self.db.upsert_comment(&comment).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Count-delta new-route discovery for one root area (spec §4.4.4).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub fn discover_new<'a>(
        &'a self,
        area_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<DiscoverySummary, Error>> + Send + 'a>> {
        Box::pin(async move {
            let cached = self.db.route_count(area_id).await?;
            let upstream_area = self.upstream.fetch_area(area_id).await?;
            let current = upstream_area.total_route_count() as i32;

            let Some(cached) = cached else {
                self.db.update_route_count(area_id, current).await?;
                return Ok(DiscoverySummary::default());
            };

            if current == cached {
                self.db.update_route_count(area_id, current).await?;
                return Ok(DiscoverySummary::default());
            }

            if current < cached {
                self.db.update_route_count(area_id, current).await?;
                return Ok(DiscoverySummary::default());
            }

            let sub_areas: Vec<i64> = upstream_area
                .children
                .iter()
                .filter(|c| !c.kind.eq_ignore_ascii_case("route"))
                .map(|c| c.id)
                .collect();

            let mut discovered = 0;
            if !sub_areas.is_empty() {
                for child in sub_areas {
                    let summary = self.discover_new(child).await?;
                    discovered += summary.new_routes;
                }
            } else {
                let existing: std::collections::HashSet<i64> = self
                    .db
                    .route_ids_for_area(area_id, false)
                    .await?
                    .into_iter()
                    .collect();
                for child in &upstream_area.children {
                    if !child.kind.eq_ignore_ascii_case("route") || existing.contains(&child.id) {
                        continue;
                    }
                    let route_type = RouteTypes::parse(&child.route_types.join(", "));
                    let route = Route {
                        mp_route_id: child.id,
                        mp_area_id: area_id,
                        name: child.title.clone(),
                        route_type,
                        rating: None,
                        location_id: None,
                        latitude: None,
                        longitude: None,
                        aspect: None,
                        created_at: Utc::now().naive_utc(),
                        updated_at: Utc::now().naive_utc(),
                    };
                    if let Err(e) = self.db.upsert_route(&route).await {
                        tracing::warn!(route_id = child.id, error = %e, "failed to upsert discovered route, skipping");
                        continue;
                    }
                    if let Err(e) = self.sync_ticks_for_route(child.id).await {
                        tracing::warn!(route_id = child.id, error = %e, "tick sync failed for discovered route");
                    }
                    if let Err(e) = self.sync_comments_for_route(child.id).await {
                        tracing::warn!(route_id = child.id, error = %e, "comment sync failed for discovered route");
                    }
                    discovered += 1;
                }
            }

            self.db.update_route_count(area_id, current).await?;
            Ok(DiscoverySummary { new_routes: discovered })
        })
    }

    /// One tiered-periodic-sync invocation (spec §4.4.5): selects due
    /// routes and runs tick or comment sync on each.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn tiered_sync(
        &self,
        selector: SyncSelector,
        kind: SyncKind,
        progress: &mut ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let route_ids = self.db.routes_due_for_sync(selector, kind).await?;
        for route_id in route_ids {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let result = match kind {
                SyncKind::Tick => self.sync_ticks_for_route(route_id).await.map(|_| ()),
                SyncKind::Comment => self.sync_comments_for_route(route_id).await.map(|_| ()),
            };
            match result {
                Ok(()) => {
                    progress
                        .record_success(Some(serde_json::json!({ "route_id": route_id })))
                        .await?;
                }
                Err(e) => {
                    tracing::warn!(route_id, error = %e, "tiered sync item failed");
                    progress
                        .record_failure(Some(serde_json::json!({ "route_id": route_id })))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// A point on a ring of `n` positions around `(center_lat, center_lon)`,
/// evenly spaced angularly, with an aspect derived from its bearing
/// (spec §4.4.1 step 5).
fn ring_position(center_lat: f64, center_lon: f64, index: usize, n: usize) -> (f64, f64, Aspect) {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    const BASE_RADIUS_M: f64 = 8.0;

    let n = n.max(1) as f64;
    let bearing_deg = 360.0 * (index as f64) / n;
    let bearing_rad = bearing_deg.to_radians();
    let radius_m = BASE_RADIUS_M * n.sqrt();

    let delta_lat = (radius_m / EARTH_RADIUS_M) * bearing_rad.cos();
    let delta_lon = (radius_m / EARTH_RADIUS_M) * bearing_rad.sin() / center_lat.to_radians().cos();

    let lat = center_lat + delta_lat.to_degrees();
    let lon = center_lon + delta_lon.to_degrees();
    (lat, lon, Aspect::from_bearing_degrees(bearing_deg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{CommentFetchTarget as Target, OpaqueText, UpstreamArea, UpstreamChild, UpstreamComment, UpstreamTick, User};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeUpstream {
        pub areas: Mutex<std::collections::HashMap<i64, UpstreamArea>>,
        pub ticks: Mutex<std::collections::HashMap<i64, Vec<UpstreamTick>>>,
        pub comments: Mutex<std::collections::HashMap<(bool, i64), Vec<UpstreamComment>>>,
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn fetch_area(&self, id: i64) -> Result<UpstreamArea, Error> {
            self.areas
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::Upstream("no such area".into()))
        }

        async fn fetch_ticks(&self, route_id: i64) -> Result<Vec<UpstreamTick>, Error> {
            Ok(self.ticks.lock().unwrap().get(&route_id).cloned().unwrap_or_default())
        }

        async fn fetch_comments(&self, target: Target) -> Result<Vec<UpstreamComment>, Error> {
            let key = match target {
                Target::Route(id) => (true, id),
                Target::Area(id) => (false, id),
            };
            Ok(self.comments.lock().unwrap().get(&key).cloned().unwrap_or_default())
        }
    }

    fn sample_tick(date: &str, user: &str) -> UpstreamTick {
        UpstreamTick {
            date: date.to_string(),
            user: User::Raw(user.to_string()),
            text: OpaqueText::Raw(String::new()),
            style: "Lead".to_string(),
        }
    }

    #[test]
    fn ring_position_spaces_points_evenly_and_assigns_aspect() {
        let (lat0, lon0, aspect0) = ring_position(40.0, -105.0, 0, 4);
        let (_, _, aspect1) = ring_position(40.0, -105.0, 1, 4);
        assert_ne!((lat0, lon0), (40.0, -105.0));
        assert_eq!(aspect0, Aspect::N);
        assert_eq!(aspect1, Aspect::E);
    }

    #[test]
    fn cancel_token_reports_cancellation() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn sample_tick_builds_minimal_fixture() {
        let t = sample_tick("2025-01-11", "abel");
        assert_eq!(t.date, "2025-01-11");
        assert_eq!(t.user.display_name(), "abel");
    }
}
