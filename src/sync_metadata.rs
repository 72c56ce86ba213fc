//! Per-route sync metadata: the metrics the classifier reads and
//! writes, and the "due for sync" selection queries the tiered
//! periodic-sync pipeline (spec §4.4.5) runs against them.

use chrono::{Duration, NaiveDateTime, Utc};
use diesel::{BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl, Queryable};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::{
    schema::{route_sync_metadata, routes},
    store::Database,
    types::SyncTier,
    Error,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Queryable)]
pub struct RouteSyncMetadata {
    pub mp_route_id: i64,
    pub sync_priority: String,
    pub last_tick_sync_at: Option<NaiveDateTime>,
    pub last_comment_sync_at: Option<NaiveDateTime>,
    pub tick_count_14d: i32,
    pub tick_count_90d: i32,
    pub total_tick_count: i32,
    pub days_since_last_tick: Option<i32>,
    pub area_percentile: Option<f64>,
    pub route_age_days: i32,
}

impl RouteSyncMetadata {
    #[must_use]
    pub fn tier(&self) -> SyncTier {
        self.sync_priority.parse().unwrap_or(SyncTier::Low)
    }
}

/// Which population of routes a periodic-sync invocation should select
/// (spec §4.4.5): either a non-location tier, or the location-bound set
/// that syncs daily regardless of tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncSelector {
    Tier(SyncTier),
    LocationBound,
}

/// Which per-route timestamp a selection or update targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncKind {
    Tick,
    Comment,
}

impl Database {
    /// Reads a route's sync metadata, if it has been computed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn sync_metadata(&self, mp_route_id: i64) -> Result<Option<RouteSyncMetadata>, Error> {
        let mut conn = self.pool().get().await?;
        route_sync_metadata::table
            .filter(route_sync_metadata::mp_route_id.eq(mp_route_id))
            .first::<RouteSyncMetadata>(&mut conn)
            .await
            .optional()
            .map_err(Error::from)
    }

    /// Route ids due for a tick or comment sync under `selector`, per
    /// the cadence table in spec §4.4.5: a route with no prior sync is
    /// always due.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn routes_due_for_sync(
        &self,
        selector: SyncSelector,
        kind: SyncKind,
    ) -> Result<Vec<i64>, Error> {
        let mut conn = self.pool().get().await?;
        let now = Utc::now().naive_utc();

        let cadence = match selector {
            SyncSelector::Tier(tier) => tier.cadence(),
            SyncSelector::LocationBound => Duration::days(1),
        };
        let cutoff = now - cadence;

        let mut query = routes::table
            .inner_join(route_sync_metadata::table)
            .into_boxed();

        query = match selector {
            SyncSelector::Tier(tier) => query
                .filter(routes::location_id.is_null())
                .filter(route_sync_metadata::sync_priority.eq(tier.to_string().to_lowercase())),
            SyncSelector::LocationBound => query.filter(routes::location_id.is_not_null()),
        };

        let last_sync_col = match kind {
            SyncKind::Tick => route_sync_metadata::last_tick_sync_at,
            SyncKind::Comment => route_sync_metadata::last_comment_sync_at,
        };

        query = query.filter(last_sync_col.lt(cutoff).or(last_sync_col.is_null()));

        let ids = query
            .select(routes::mp_route_id)
            .load::<i64>(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Records that a route's ticks were just synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn touch_tick_sync(&self, mp_route_id: i64) -> Result<(), Error> {
        let mut conn = self.pool().get().await?;
        diesel::update(
            route_sync_metadata::table.filter(route_sync_metadata::mp_route_id.eq(mp_route_id)),
        )
        .set(route_sync_metadata::last_tick_sync_at.eq(Utc::now().naive_utc()))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    /// Records that a route's comments were just synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn touch_comment_sync(&self, mp_route_id: i64) -> Result<(), Error> {
        let mut conn = self.pool().get().await?;
        diesel::update(
            route_sync_metadata::table.filter(route_sync_metadata::mp_route_id.eq(mp_route_id)),
        )
        .set(route_sync_metadata::last_comment_sync_at.eq(Utc::now().naive_utc()))
        .execute(&mut conn)
        .await?;
        Ok(())
    }
}
