//! The priority classifier (spec §4.3): a single batch operation that
//! recomputes every non-location-bound route's sync tier from its
//! observed metrics, evaluating signals S1-L1 in order with first match
//! winning.

use chrono::{NaiveDateTime, Utc};
use diesel::sql_types::{BigInt, Double, Nullable, Text, Timestamp};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::{
    schema::route_sync_metadata,
    store::Database,
    types::{RouteTypes, SyncTier},
    Error,
};

/// Per-route metrics read by the classifier, aggregated in a single
/// query against ticks and the owning area (spec §4.3: area percentile
/// is computed within the owning area).
#[derive(Debug, QueryableByName)]
struct RouteMetricsRow {
    #[diesel(sql_type = BigInt)]
    mp_route_id: i64,
    #[diesel(sql_type = Text)]
    route_type: String,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    location_bound: bool,
    #[diesel(sql_type = BigInt)]
    tick_count_14d: i64,
    #[diesel(sql_type = BigInt)]
    tick_count_90d: i64,
    #[diesel(sql_type = BigInt)]
    total_tick_count: i64,
    #[diesel(sql_type = Nullable<Timestamp>)]
    last_tick_at: Option<NaiveDateTime>,
    #[diesel(sql_type = Double)]
    area_percentile: f64,
    #[diesel(sql_type = Timestamp)]
    created_at: NaiveDateTime,
}

/// The metrics snapshot the signal evaluator works from, independent of
/// SQL so it can be unit tested deterministically (spec §8 properties 4
/// and 5).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RouteMetrics {
    pub route_type: RouteTypes,
    pub tick_count_14d: i64,
    pub tick_count_90d: i64,
    pub total_tick_count: i64,
    pub days_since_last_tick: Option<i64>,
    pub area_percentile: f64,
    pub route_age_days: i64,
}

/// Evaluates the classifier's signals (spec §4.3 table) in order,
/// returning the first match. Pure and deterministic: the same metrics
/// snapshot always yields the same tier.
#[must_use]
pub fn classify_tier(m: &RouteMetrics) -> SyncTier {
    // S1 Seasonal activity
    if m.route_type.is_seasonal() && m.tick_count_90d >= 1 {
        return SyncTier::High;
    }
    // S2 Activity surge
    if m.tick_count_14d >= 1 && m.days_since_last_tick.is_some_and(|d| d > 90) {
        return SyncTier::High;
    }
    // S3 Per-area popularity
    if m.area_percentile >= 0.90 {
        return SyncTier::High;
    }
    // S4 Absolute popularity
    if m.tick_count_90d >= 20 {
        return SyncTier::High;
    }
    // S5 New + active
    if m.route_age_days < 90 && m.total_tick_count >= 1 {
        return SyncTier::High;
    }
    // M1 Any recent or above-median
    if m.tick_count_90d >= 1 || m.area_percentile >= 0.50 {
        return SyncTier::Medium;
    }
    // L1 otherwise
    SyncTier::Low
}

/// Distribution of routes across tiers after a classifier run, emitted
/// for monitoring (spec §4.3: "emits a distribution summary").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub location_bound_skipped: u64,
}

impl ClassificationSummary {
    #[must_use]
    pub fn total_classified(&self) -> u64 {
        self.high + self.medium + self.low
    }
}

/// Runs the priority classifier against the whole catalog.
pub struct Classifier<'a> {
    db: &'a Database,
}

const METRICS_QUERY: &str = "
WITH sanitized_ticks AS (
    SELECT
        mp_route_id,
        CASE
            WHEN climbed_at - now() BETWEEN INTERVAL '350 days' AND INTERVAL '380 days'
                THEN climbed_at - INTERVAL '365 days'
            ELSE climbed_at
        END AS adjusted_at
    FROM ticks
),
filtered_ticks AS (
    SELECT mp_route_id, adjusted_at
    FROM sanitized_ticks
    WHERE adjusted_at <= now() + INTERVAL '30 days'
),
metrics AS (
    SELECT
        r.mp_route_id,
        COUNT(*) FILTER (WHERE ft.adjusted_at >= now() - INTERVAL '14 days') AS tick_count_14d,
        COUNT(*) FILTER (WHERE ft.adjusted_at >= now() - INTERVAL '90 days') AS tick_count_90d,
        COUNT(ft.adjusted_at) AS total_tick_count,
        MAX(ft.adjusted_at) AS last_tick_at
    FROM routes r
    LEFT JOIN filtered_ticks ft ON ft.mp_route_id = r.mp_route_id
    GROUP BY r.mp_route_id
)
SELECT
    r.mp_route_id,
    r.route_type,
    (r.location_id IS NOT NULL) AS location_bound,
    m.tick_count_14d,
    m.tick_count_90d,
    m.total_tick_count,
    m.last_tick_at,
    COALESCE(
        PERCENT_RANK() OVER (PARTITION BY r.mp_area_id ORDER BY m.tick_count_90d),
        0.0
    ) AS area_percentile,
    r.created_at
FROM routes r
JOIN metrics m ON m.mp_route_id = r.mp_route_id";

impl<'a> Classifier<'a> {
    #[must_use]
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Recomputes metrics and tiers for every route.
    ///
    /// Location-bound routes (spec §9 open question 4: those carrying a
    /// `location_id`) have their metrics refreshed but keep their prior
    /// tier — they are synced daily regardless of tier (spec §4.4.5),
    /// so tiering them would be meaningless. They still get a
    /// `route_sync_metadata` row (metrics only, `sync_priority` left
    /// alone on conflict): `routes_due_for_sync`'s `LocationBound`
    /// selector joins against this table, so a location-bound route
    /// with no row here would never be selected for its daily sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying queries fail.
    pub async fn recompute(&self) -> Result<ClassificationSummary, Error> {
        let mut conn = self.db.pool().get().await?;
        let now = Utc::now().naive_utc();

        let rows: Vec<RouteMetricsRow> = diesel::sql_query(METRICS_QUERY).load(&mut conn).await?;

        let mut summary = ClassificationSummary::default();
        let mut tiered_upserts: Vec<(i64, String, i32, i32, i32, Option<i32>, f64, i32)> = Vec::new();
        let mut location_bound_upserts: Vec<(i64, i32, i32, i32, Option<i32>, f64, i32)> = Vec::new();

        for row in &rows {
            let age_days = (now - row.created_at).num_days();
            let days_since_last_tick = row.last_tick_at.map(|last| (now - last).num_days());

            if row.location_bound {
                summary.location_bound_skipped += 1;
                location_bound_upserts.push((
                    row.mp_route_id,
                    row.tick_count_14d as i32,
                    row.tick_count_90d as i32,
                    row.total_tick_count as i32,
                    days_since_last_tick.map(|d| d as i32),
                    row.area_percentile,
                    age_days as i32,
                ));
                continue;
            }

            let metrics = RouteMetrics {
                route_type: RouteTypes::parse(&row.route_type),
                tick_count_14d: row.tick_count_14d,
                tick_count_90d: row.tick_count_90d,
                total_tick_count: row.total_tick_count,
                days_since_last_tick,
                area_percentile: row.area_percentile,
                route_age_days: age_days,
            };
            let tier = classify_tier(&metrics);
            match tier {
                SyncTier::High => summary.high += 1,
                SyncTier::Medium => summary.medium += 1,
                SyncTier::Low => summary.low += 1,
            }

            tiered_upserts.push((
                row.mp_route_id,
                tier.to_string().to_lowercase(),
                row.tick_count_14d as i32,
                row.tick_count_90d as i32,
                row.total_tick_count as i32,
                days_since_last_tick.map(|d| d as i32),
                row.area_percentile,
                age_days as i32,
            ));
        }

        for chunk in tiered_upserts.chunks(500) {
            let values: Vec<_> = chunk
                .iter()
                .map(
                    |(id, tier, t14, t90, total, days_since, pct, age)| {
                        (
                            route_sync_metadata::mp_route_id.eq(*id),
                            route_sync_metadata::sync_priority.eq(tier.clone()),
                            route_sync_metadata::tick_count_14d.eq(*t14),
                            route_sync_metadata::tick_count_90d.eq(*t90),
                            route_sync_metadata::total_tick_count.eq(*total),
                            route_sync_metadata::days_since_last_tick.eq(*days_since),
                            route_sync_metadata::area_percentile.eq(*pct),
                            route_sync_metadata::route_age_days.eq(*age),
                        )
                    },
                )
                .collect();

            diesel::insert_into(route_sync_metadata::table)
                .values(values)
                .on_conflict(route_sync_metadata::mp_route_id)
                .do_update()
                .set((
                    route_sync_metadata::sync_priority
                        .eq(diesel::upsert::excluded(route_sync_metadata::sync_priority)),
                    route_sync_metadata::tick_count_14d
                        .eq(diesel::upsert::excluded(route_sync_metadata::tick_count_14d)),
                    route_sync_metadata::tick_count_90d
                        .eq(diesel::upsert::excluded(route_sync_metadata::tick_count_90d)),
                    route_sync_metadata::total_tick_count
                        .eq(diesel::upsert::excluded(route_sync_metadata::total_tick_count)),
                    route_sync_metadata::days_since_last_tick
                        .eq(diesel::upsert::excluded(route_sync_metadata::days_since_last_tick)),
                    route_sync_metadata::area_percentile
                        .eq(diesel::upsert::excluded(route_sync_metadata::area_percentile)),
                    route_sync_metadata::route_age_days
                        .eq(diesel::upsert::excluded(route_sync_metadata::route_age_days)),
                ))
                .execute(&mut conn)
                .await?;
        }

        for chunk in location_bound_upserts.chunks(500) {
            let values: Vec<_> = chunk
                .iter()
                .map(|(id, t14, t90, total, days_since, pct, age)| {
                    (
                        route_sync_metadata::mp_route_id.eq(*id),
                        route_sync_metadata::sync_priority.eq("low"),
                        route_sync_metadata::tick_count_14d.eq(*t14),
                        route_sync_metadata::tick_count_90d.eq(*t90),
                        route_sync_metadata::total_tick_count.eq(*total),
                        route_sync_metadata::days_since_last_tick.eq(*days_since),
                        route_sync_metadata::area_percentile.eq(*pct),
                        route_sync_metadata::route_age_days.eq(*age),
                    )
                })
                .collect();

            diesel::insert_into(route_sync_metadata::table)
                .values(values)
                .on_conflict(route_sync_metadata::mp_route_id)
                .do_update()
                .set((
                    route_sync_metadata::tick_count_14d
                        .eq(diesel::upsert::excluded(route_sync_metadata::tick_count_14d)),
                    route_sync_metadata::tick_count_90d
                        .eq(diesel::upsert::excluded(route_sync_metadata::tick_count_90d)),
                    route_sync_metadata::total_tick_count
                        .eq(diesel::upsert::excluded(route_sync_metadata::total_tick_count)),
                    route_sync_metadata::days_since_last_tick
                        .eq(diesel::upsert::excluded(route_sync_metadata::days_since_last_tick)),
                    route_sync_metadata::area_percentile
                        .eq(diesel::upsert::excluded(route_sync_metadata::area_percentile)),
                    route_sync_metadata::route_age_days
                        .eq(diesel::upsert::excluded(route_sync_metadata::route_age_days)),
                ))
                .execute(&mut conn)
                .await?;
        }

        tracing::info!(
            high = summary.high,
            medium = summary.medium,
            low = summary.low,
            location_bound_skipped = summary.location_bound_skipped,
            "priority classifier recompute finished"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_metrics() -> RouteMetrics {
        RouteMetrics {
            route_type: RouteTypes::parse("Sport"),
            tick_count_14d: 0,
            tick_count_90d: 0,
            total_tick_count: 0,
            days_since_last_tick: None,
            area_percentile: 0.0,
            route_age_days: 1000,
        }
    }

    #[test]
    fn s1_seasonal_route_with_recent_activity_is_high() {
        let metrics = RouteMetrics {
            route_type: RouteTypes::parse("Ice"),
            tick_count_90d: 1,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn s1_composite_seasonal_type_still_matches() {
        let metrics = RouteMetrics {
            route_type: RouteTypes::parse("Ice, Mixed"),
            tick_count_90d: 1,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn s2_surge_after_long_dormancy_is_high() {
        let metrics = RouteMetrics {
            tick_count_14d: 1,
            days_since_last_tick: Some(120),
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn s2_requires_both_recent_activity_and_dormancy() {
        let metrics = RouteMetrics {
            tick_count_14d: 1,
            days_since_last_tick: Some(10),
            ..base_metrics()
        };
        assert_ne!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn s3_top_decile_in_area_is_high() {
        let metrics = RouteMetrics {
            area_percentile: 0.95,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn s4_absolute_popularity_is_high() {
        let metrics = RouteMetrics {
            tick_count_90d: 20,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn s5_new_and_active_is_high() {
        let metrics = RouteMetrics {
            route_age_days: 10,
            total_tick_count: 1,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn m1_any_recent_activity_is_medium_when_no_high_signal_fires() {
        let metrics = RouteMetrics {
            tick_count_90d: 1,
            route_age_days: 1000,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::Medium);
    }

    #[test]
    fn m1_above_median_percentile_is_medium() {
        let metrics = RouteMetrics {
            area_percentile: 0.60,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::Medium);
    }

    #[test]
    fn l1_otherwise_is_low() {
        assert_eq!(classify_tier(&base_metrics()), SyncTier::Low);
    }

    #[test]
    fn signal_order_prefers_high_over_otherwise_low() {
        // A route meeting both S1 (seasonal) and, absent S1, would
        // otherwise fall through to L1 must classify high: first match
        // wins (spec §8 property 5).
        let metrics = RouteMetrics {
            route_type: RouteTypes::parse("Ice"),
            tick_count_90d: 1,
            ..base_metrics()
        };
        assert_eq!(classify_tier(&metrics), SyncTier::High);
    }

    #[test]
    fn classifier_is_deterministic_for_fixed_inputs() {
        let metrics = RouteMetrics {
            tick_count_90d: 5,
            ..base_metrics()
        };
        let first = classify_tier(&metrics);
        let second = classify_tier(&metrics);
        assert_eq!(first, second);
    }
}
