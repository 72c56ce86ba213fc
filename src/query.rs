//! Read-only activity views over the store (spec §4.7). Every query
//! that reads ticks applies the shared date-sanitization policy
//! (§4.2) in-line, via the same `sanitized_ticks`/`filtered_ticks` CTE
//! shape the classifier uses.

use diesel::sql_types::{BigInt, Bool, Nullable, Text, Timestamp};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, PgTextExpressionMethods, QueryDsl, Queryable,
    QueryableByName,
};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::{
    date_policy::RECENCY_WINDOW_DAYS,
    schema::{areas, routes},
    store::Database,
    Error,
};

const SANITIZED_TICKS_CTE: &str = "
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
      AND adjusted_at >= now() - INTERVAL '730 days'
)";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AreaActivity {
    pub mp_area_id: i64,
    pub name: String,
    pub most_recent_tick_at: Option<chrono::NaiveDateTime>,
    pub distinct_routes: i64,
    pub total_ticks: i64,
    pub days_since: Option<i64>,
    pub has_subareas: bool,
}

#[derive(QueryableByName)]
struct AreaActivityRow {
    #[diesel(sql_type = BigInt)]
    mp_area_id: i64,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Nullable<Timestamp>)]
    most_recent_tick_at: Option<chrono::NaiveDateTime>,
    #[diesel(sql_type = BigInt)]
    distinct_routes: i64,
    #[diesel(sql_type = BigInt)]
    total_ticks: i64,
    #[diesel(sql_type = Bool)]
    has_subareas: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteActivity {
    pub mp_route_id: i64,
    pub name: String,
    pub most_recent_tick_at: Option<chrono::NaiveDateTime>,
}

#[derive(QueryableByName)]
struct RouteActivityRow {
    #[diesel(sql_type = BigInt)]
    mp_route_id: i64,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Nullable<Timestamp>)]
    most_recent_tick_at: Option<chrono::NaiveDateTime>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SearchHitKind {
    Area,
    Route,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: SearchHitKind,
    pub id: i64,
    pub name: String,
    pub most_recent_tick_at: Option<chrono::NaiveDateTime>,
}

impl Database {
    /// Per-top-level-child aggregate activity under `root_area_id`,
    /// sorted most-recent-tick first with unvisited children last
    /// (spec §4.7: areas-by-activity, subareas-by-activity — same
    /// shape rooted at a location's root or at any parent).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn areas_by_activity(&self, root_area_id: i64) -> Result<Vec<AreaActivity>, Error> {
        let children = self.child_area_ids(root_area_id).await?;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let subtree = self.area_subtree_ids(child).await?;
            let mut conn = self.pool().get().await?;
            let query = format!(
                "{SANITIZED_TICKS_CTE}
                 SELECT
                     a.mp_area_id,
                     a.name,
                     MAX(ft.adjusted_at) AS most_recent_tick_at,
                     COUNT(DISTINCT r.mp_route_id) AS distinct_routes,
                     COUNT(ft.adjusted_at) AS total_ticks,
                     EXISTS(SELECT 1 FROM areas c WHERE c.parent_mp_area_id = a.mp_area_id) AS has_subareas
                 FROM areas a
                 LEFT JOIN routes r ON r.mp_area_id = ANY($1)
                 LEFT JOIN filtered_ticks ft ON ft.mp_route_id = r.mp_route_id
                 WHERE a.mp_area_id = $2
                 GROUP BY a.mp_area_id, a.name"
            );
            let row = diesel::sql_query(query)
                .bind::<diesel::sql_types::Array<BigInt>, _>(&subtree)
                .bind::<BigInt, _>(child)
                .get_result::<AreaActivityRow>(&mut conn)
                .await?;
            out.push(AreaActivity {
                mp_area_id: row.mp_area_id,
                name: row.name,
                most_recent_tick_at: row.most_recent_tick_at,
                distinct_routes: row.distinct_routes,
                total_ticks: row.total_ticks,
                days_since: row
                    .most_recent_tick_at
                    .map(|t| (chrono::Utc::now().naive_utc() - t).num_days()),
                has_subareas: row.has_subareas,
            });
        }
        out.sort_by(|a, b| match (a.most_recent_tick_at, b.most_recent_tick_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        });
        Ok(out)
    }

    /// Alias of [`Database::areas_by_activity`] for the sub-tree case
    /// (spec §4.7: "subareas ordered by activity ... rooted at a given
    /// parent"). Kept as a distinct name because callers reach it
    /// through different entry points even though the query shape is
    /// identical.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn subareas_by_activity(&self, parent_area_id: i64) -> Result<Vec<AreaActivity>, Error> {
        self.areas_by_activity(parent_area_id).await
    }

    /// Every route directly in `area_id`; routes with at least one
    /// sanitized tick sort by most-recent tick descending, the rest
    /// sort alphabetically after them (spec §4.7).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn routes_by_activity(&self, area_id: i64) -> Result<Vec<RouteActivity>, Error> {
        let mut conn = self.pool().get().await?;
        let query = format!(
            "{SANITIZED_TICKS_CTE}
             SELECT
                 r.mp_route_id,
                 r.name,
                 MAX(ft.adjusted_at) AS most_recent_tick_at
             FROM routes r
             LEFT JOIN filtered_ticks ft ON ft.mp_route_id = r.mp_route_id
             WHERE r.mp_area_id = $1
             GROUP BY r.mp_route_id, r.name"
        );
        let rows = diesel::sql_query(query)
            .bind::<BigInt, _>(area_id)
            .load::<RouteActivityRow>(&mut conn)
            .await?;
        let mut out: Vec<RouteActivity> = rows
            .into_iter()
            .map(|r| RouteActivity {
                mp_route_id: r.mp_route_id,
                name: r.name,
                most_recent_tick_at: r.most_recent_tick_at,
            })
            .collect();
        out.sort_by(|a, b| match (a.most_recent_tick_at, b.most_recent_tick_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        });
        Ok(out)
    }

    /// Sanitized ticks for a route, newest first, paginated (spec
    /// §4.7: "recent ticks for a route").
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_ticks_for_route(
        &self,
        mp_route_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<crate::types::Tick>, Error> {
        use crate::schema::ticks;
        let mut conn = self.pool().get().await?;
        let now = chrono::Utc::now().naive_utc();
        let upper = now + chrono::Duration::days(30);
        let lower_typo_start = now + chrono::Duration::days(350);
        let lower_typo_end = now + chrono::Duration::days(380);
        let recency_cutoff = now - chrono::Duration::days(RECENCY_WINDOW_DAYS);

        #[derive(Queryable)]
        struct Row {
            id: i64,
            mp_route_id: i64,
            user_name: String,
            climbed_at: chrono::NaiveDateTime,
            style: Option<String>,
            comment: Option<String>,
        }

        let rows = ticks::table
            .filter(
                ticks::mp_route_id.eq(mp_route_id).and(
                    (ticks::climbed_at.le(upper).and(ticks::climbed_at.ge(recency_cutoff)))
                        .or(ticks::climbed_at.between(lower_typo_start, lower_typo_end)),
                ),
            )
            .order_by(ticks::climbed_at.desc())
            .limit(limit)
            .offset(offset)
            .select((
                ticks::id,
                ticks::mp_route_id,
                ticks::user_name,
                ticks::climbed_at,
                ticks::style,
                ticks::comment,
            ))
            .load::<Row>(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let climbed_at = if r.climbed_at >= lower_typo_start && r.climbed_at <= lower_typo_end {
                    r.climbed_at - chrono::Duration::days(365)
                } else {
                    r.climbed_at
                };
                crate::types::Tick {
                    id: r.id,
                    mp_route_id: r.mp_route_id,
                    user_name: r.user_name,
                    climbed_at,
                    style: r.style,
                    comment: r.comment,
                }
            })
            .collect())
    }

    /// Case-insensitive substring search over area and route names
    /// bound to `location_id` (spec §4.7, §8 property 10).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn search_in_location(
        &self,
        location_id: i32,
        term: &str,
    ) -> Result<Vec<SearchHit>, Error> {
        let mut conn = self.pool().get().await?;
        let pattern = format!("%{term}%");

        let area_hits = areas::table
            .filter(areas::location_id.eq(location_id))
            .filter(areas::name.ilike(&pattern))
            .select((areas::mp_area_id, areas::name))
            .load::<(i64, String)>(&mut conn)
            .await?;

        let route_hits = routes::table
            .filter(routes::location_id.eq(location_id))
            .filter(routes::name.ilike(&pattern))
            .select((routes::mp_route_id, routes::name))
            .load::<(i64, String)>(&mut conn)
            .await?;

        let mut hits: Vec<SearchHit> = area_hits
            .into_iter()
            .map(|(id, name)| SearchHit {
                kind: SearchHitKind::Area,
                id,
                name,
                most_recent_tick_at: None,
            })
            .collect();

        for (id, name) in route_hits {
            let recent = self.recent_ticks_for_route(id, 1, 0).await?;
            hits.push(SearchHit {
                kind: SearchHitKind::Route,
                id,
                name,
                most_recent_tick_at: recent.first().map(|t| t.climbed_at),
            });
        }

        Ok(hits)
    }
}
