//! Canonical activity data model: areas, routes, ticks, and comments.

use std::{collections::BTreeSet, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Whether an area itself holds sub-areas (`Branch`) or routes directly
/// (`Leaf`). See spec §3: "kind=leaf ⇔ has routes, not sub-areas" — an
/// invariant the source never enforces for areas that mix both; see
/// `DESIGN.md` for how this crate resolves that open question.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
pub enum AreaKind {
    Branch,
    Leaf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub mp_area_id: i64,
    pub name: String,
    pub parent_mp_area_id: Option<i64>,
    pub area_type: AreaKind,
    pub location_id: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_synced_at: Option<NaiveDateTime>,
    pub route_count: Option<i32>,
    pub last_checked_at: Option<NaiveDateTime>,
}

impl Area {
    #[must_use]
    pub fn has_gps(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// A single climbing discipline tag, as used by the seasonal-activity
/// signal (spec §4.3, S1). Upstream publishes these as a comma-joined
/// string on the route (e.g. `"Sport, Trad"`); this crate normalizes
/// that into a set at the application boundary rather than matching the
/// raw string, resolving the gap flagged in spec §9 open question 5.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum RouteType {
    Sport,
    Trad,
    #[strum(serialize = "Boulder")]
    Boulder,
    #[strum(serialize = "Toprope", serialize = "Top Rope", serialize = "TR")]
    TopRope,
    Ice,
    Alpine,
    Snow,
    Mixed,
    Aid,
}

impl RouteType {
    #[must_use]
    pub fn is_seasonal(self) -> bool {
        matches!(
            self,
            RouteType::Ice | RouteType::Alpine | RouteType::Snow | RouteType::Mixed
        )
    }

    #[must_use]
    pub fn is_boulder(self) -> bool {
        matches!(self, RouteType::Boulder)
    }
}

/// A route's set of disciplines, normalized from upstream's comma-joined
/// free text. Unrecognized tokens are dropped rather than rejected —
/// upstream's taxonomy drifts over time and a new discipline label
/// should not fail ingest.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RouteTypes(BTreeSet<RouteType>);

impl RouteTypes {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let set = raw
            .split(',')
            .filter_map(|tok| RouteType::from_str(tok.trim()).ok())
            .collect();
        Self(set)
    }

    #[must_use]
    pub fn contains(&self, t: RouteType) -> bool {
        self.0.contains(&t)
    }

    #[must_use]
    pub fn is_seasonal(&self) -> bool {
        self.0.iter().any(|t| t.is_seasonal())
    }

    #[must_use]
    pub fn is_boulder(&self) -> bool {
        self.0.iter().any(|t| t.is_boulder())
    }

    #[must_use]
    pub fn to_db_string(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for RouteTypes {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Compass aspect, assigned from the bearing of a boulder's distributed
/// GPS position around its area centroid (spec §4.4.1 step 5).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
pub enum Aspect {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Aspect {
    /// Buckets a compass bearing in degrees (`0..360`) into one of the
    /// eight ordinal directions.
    #[must_use]
    pub fn from_bearing_degrees(bearing: f64) -> Self {
        let normalized = bearing.rem_euclid(360.0);
        const DIRECTIONS: [Aspect; 8] = [
            Aspect::N,
            Aspect::NE,
            Aspect::E,
            Aspect::SE,
            Aspect::S,
            Aspect::SW,
            Aspect::W,
            Aspect::NW,
        ];
        let idx = ((normalized + 22.5) / 45.0).floor() as usize % 8;
        DIRECTIONS[idx]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub mp_route_id: i64,
    pub mp_area_id: i64,
    pub name: String,
    pub route_type: RouteTypes,
    pub rating: Option<String>,
    pub location_id: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub aspect: Option<Aspect>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Route {
    /// A route is "location-bound" when it carries a first-party
    /// `location_id`, inherited from the root of the recursive sync
    /// that discovered it (spec §3, §9 open question 4). Location-bound
    /// routes are synced daily regardless of tier and are exempt from
    /// the priority classifier.
    #[must_use]
    pub fn is_location_bound(&self) -> bool {
        self.location_id.is_some()
    }

    #[must_use]
    pub fn has_gps(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub id: i64,
    pub mp_route_id: i64,
    pub user_name: String,
    pub climbed_at: NaiveDateTime,
    pub style: Option<String>,
    pub comment: Option<String>,
}

/// A comment's owner: a route xor an area (spec §3, §9 design note 2).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommentTarget {
    Route(i64),
    Area(i64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub mp_comment_id: i64,
    pub target: CommentTarget,
    pub user_name: String,
    pub comment_text: String,
    pub commented_at: NaiveDateTime,
}

/// Sync tier, governing how often a (non-location-bound) route's ticks
/// and comments are refreshed (spec §4.3, §4.4.5).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum SyncTier {
    High,
    Medium,
    Low,
}

impl SyncTier {
    /// The periodic-sync cadence for this tier (spec §4.4.5 table).
    #[must_use]
    pub fn cadence(self) -> chrono::Duration {
        match self {
            SyncTier::High => chrono::Duration::days(1),
            SyncTier::Medium => chrono::Duration::weeks(1),
            SyncTier::Low => chrono::Duration::days(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_types_parses_composite_string_as_a_set() {
        let types = RouteTypes::parse("Ice, Mixed");
        assert!(types.is_seasonal());
        assert!(types.contains(RouteType::Ice));
        assert!(types.contains(RouteType::Mixed));
        assert!(!types.contains(RouteType::Sport));
    }

    #[test]
    fn route_types_ignores_unknown_tokens() {
        let types = RouteTypes::parse("Sport, Something New");
        assert!(types.contains(RouteType::Sport));
        assert_eq!(types.to_db_string(), "Sport");
    }

    #[test]
    fn aspect_buckets_bearing_into_eight_directions() {
        assert_eq!(Aspect::from_bearing_degrees(0.0), Aspect::N);
        assert_eq!(Aspect::from_bearing_degrees(44.0), Aspect::NE);
        assert_eq!(Aspect::from_bearing_degrees(359.0), Aspect::N);
        assert_eq!(Aspect::from_bearing_degrees(180.0), Aspect::S);
    }

    #[test]
    fn sync_tier_cadence_matches_spec_table() {
        assert_eq!(SyncTier::High.cadence(), chrono::Duration::days(1));
        assert_eq!(SyncTier::Medium.cadence(), chrono::Duration::weeks(1));
        assert_eq!(SyncTier::Low.cadence(), chrono::Duration::days(30));
    }
}
