//! The catalog store: upserts, batch reads, recursive-tree traversals,
//! and the priority-metric view (spec §4.1).

use chrono::{NaiveDateTime, Utc};
use diesel::{
    sql_types::BigInt, BoolExpressionMethods, ExpressionMethods, OptionalExtension, Queryable,
    QueryDsl, QueryableByName,
};
use diesel_async::RunQueryDsl;

use crate::{
    backends::ConnectionPool,
    date_policy::validate_climbed_at_for_write,
    schema::{areas, comments, routes, ticks},
    types::{Area, AreaKind, Aspect, Comment, CommentTarget, Route, RouteTypes, Tick},
    Error,
};

/// The maximum depth the recursive area-tree traversal will follow.
/// Bounds runtime even over cyclic or pathologically deep data (spec
/// §4.1: "must terminate even with ill-formed data").
const MAX_TREE_DEPTH: i64 = 1000;

#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

#[derive(Queryable)]
struct AreaRow {
    mp_area_id: i64,
    name: String,
    parent_mp_area_id: Option<i64>,
    area_type: String,
    location_id: Option<i32>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    last_synced_at: Option<NaiveDateTime>,
    route_count: Option<i32>,
    last_checked_at: Option<NaiveDateTime>,
}

impl From<AreaRow> for Area {
    fn from(r: AreaRow) -> Self {
        Area {
            mp_area_id: r.mp_area_id,
            name: r.name,
            parent_mp_area_id: r.parent_mp_area_id,
            area_type: r.area_type.parse().unwrap_or(AreaKind::Leaf),
            location_id: r.location_id,
            latitude: r.latitude,
            longitude: r.longitude,
            last_synced_at: r.last_synced_at,
            route_count: r.route_count,
            last_checked_at: r.last_checked_at,
        }
    }
}

#[derive(Queryable)]
struct RouteRow {
    mp_route_id: i64,
    mp_area_id: i64,
    name: String,
    route_type: String,
    rating: Option<String>,
    location_id: Option<i32>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    aspect: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl From<RouteRow> for Route {
    fn from(r: RouteRow) -> Self {
        Route {
            mp_route_id: r.mp_route_id,
            mp_area_id: r.mp_area_id,
            name: r.name,
            route_type: RouteTypes::parse(&r.route_type),
            rating: r.rating,
            location_id: r.location_id,
            latitude: r.latitude,
            longitude: r.longitude,
            aspect: r.aspect.and_then(|a| a.parse().ok()),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(QueryableByName)]
struct AreaIdRow {
    #[diesel(sql_type = BigInt)]
    mp_area_id: i64,
}

impl Database {
    /// Connects to Postgres through a TLS-secured, bounded connection
    /// pool (spec §5: 25 max / 5 idle / 5-minute lifetime by default).
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration or the initial
    /// connection fails.
    pub async fn new<P: AsRef<std::path::Path>>(
        database_url: &str,
        extra_root_ca: &[P],
        max_size: u32,
        min_idle: u32,
    ) -> Result<Self, Error> {
        let pool = ConnectionPool::new(database_url, extra_root_ca, max_size, min_idle).await?;
        Ok(Self { pool })
    }

    /// Upserts an area by its stable upstream id (spec §4.1).
    ///
    /// # Errors
    ///
    /// Returns an error if the parent area (when set) does not exist or
    /// the query otherwise fails.
    pub async fn upsert_area(&self, area: &Area) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(areas::table)
            .values((
                areas::mp_area_id.eq(area.mp_area_id),
                areas::name.eq(&area.name),
                areas::parent_mp_area_id.eq(area.parent_mp_area_id),
                areas::area_type.eq(area.area_type.to_string()),
                areas::location_id.eq(area.location_id),
                areas::latitude.eq(area.latitude),
                areas::longitude.eq(area.longitude),
                areas::last_synced_at.eq(area.last_synced_at),
                areas::route_count.eq(area.route_count),
                areas::last_checked_at.eq(area.last_checked_at),
            ))
            .on_conflict(areas::mp_area_id)
            .do_update()
            .set((
                areas::name.eq(&area.name),
                areas::parent_mp_area_id.eq(area.parent_mp_area_id),
                areas::area_type.eq(area.area_type.to_string()),
                areas::location_id.eq(area.location_id),
                areas::latitude.eq(area.latitude),
                areas::longitude.eq(area.longitude),
                areas::last_synced_at.eq(area.last_synced_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Upserts a route by its stable upstream id, with optional GPS
    /// (spec §4.1).
    ///
    /// # Errors
    ///
    /// Returns an error if the owning area does not exist or the query
    /// otherwise fails.
    pub async fn upsert_route(&self, route: &Route) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().naive_utc();
        diesel::insert_into(routes::table)
            .values((
                routes::mp_route_id.eq(route.mp_route_id),
                routes::mp_area_id.eq(route.mp_area_id),
                routes::name.eq(&route.name),
                routes::route_type.eq(route.route_type.to_db_string()),
                routes::rating.eq(&route.rating),
                routes::location_id.eq(route.location_id),
                routes::latitude.eq(route.latitude),
                routes::longitude.eq(route.longitude),
                routes::aspect.eq(route.aspect.map(|a| a.to_string())),
                routes::created_at.eq(now),
                routes::updated_at.eq(now),
            ))
            .on_conflict(routes::mp_route_id)
            .do_update()
            .set((
                routes::mp_area_id.eq(route.mp_area_id),
                routes::name.eq(&route.name),
                routes::route_type.eq(route.route_type.to_db_string()),
                routes::rating.eq(&route.rating),
                routes::location_id.eq(route.location_id),
                routes::latitude.eq(route.latitude),
                routes::longitude.eq(route.longitude),
                routes::aspect.eq(route.aspect.map(|a| a.to_string())),
                routes::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Updates a route's GPS position and aspect without touching its
    /// other fields (spec §4.1: `UpdateRouteGPS`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn update_route_gps(
        &self,
        mp_route_id: i64,
        latitude: f64,
        longitude: f64,
        aspect: Aspect,
    ) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        diesel::update(routes::table.filter(routes::mp_route_id.eq(mp_route_id)))
            .set((
                routes::latitude.eq(latitude),
                routes::longitude.eq(longitude),
                routes::aspect.eq(aspect.to_string()),
                routes::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Upserts a tick, rejecting hard-invalid future dates (spec §4.2).
    /// Returns `true` if a new row was inserted, `false` if the
    /// `(route, climber, instant)` key already existed.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `climbed_at` is more than 24h in
    /// the future, or an error if the query fails.
    pub async fn upsert_tick(&self, tick: &Tick) -> Result<bool, Error> {
        validate_climbed_at_for_write(tick.climbed_at, Utc::now().naive_utc())?;
        let mut conn = self.pool.get().await?;
        let inserted = diesel::insert_into(ticks::table)
            .values((
                ticks::mp_route_id.eq(tick.mp_route_id),
                ticks::user_name.eq(&tick.user_name),
                ticks::climbed_at.eq(tick.climbed_at),
                ticks::style.eq(&tick.style),
                ticks::comment.eq(&tick.comment),
            ))
            .on_conflict((ticks::mp_route_id, ticks::user_name, ticks::climbed_at))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    /// The most recent `climbed_at` recorded for a route, or `None` if
    /// it has never been synced (spec §4.1: `LastTickAt`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn last_tick_at(&self, mp_route_id: i64) -> Result<Option<NaiveDateTime>, Error> {
        let mut conn = self.pool.get().await?;
        ticks::table
            .filter(ticks::mp_route_id.eq(mp_route_id))
            .select(diesel::dsl::max(ticks::climbed_at))
            .first::<Option<NaiveDateTime>>(&mut conn)
            .await
            .map_err(Error::from)
    }

    /// Upserts a comment by its stable upstream id, owned by a route xor
    /// an area (spec §3, §9 design note 2).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn upsert_comment(&self, comment: &Comment) -> Result<(), Error> {
        let (route_id, area_id) = match comment.target {
            CommentTarget::Route(id) => (Some(id), None),
            CommentTarget::Area(id) => (None, Some(id)),
        };
        let mut conn = self.pool.get().await?;
        diesel::insert_into(comments::table)
            .values((
                comments::mp_comment_id.eq(comment.mp_comment_id),
                comments::mp_route_id.eq(route_id),
                comments::mp_area_id.eq(area_id),
                comments::user_name.eq(&comment.user_name),
                comments::comment_text.eq(&comment.comment_text),
                comments::commented_at.eq(comment.commented_at),
            ))
            .on_conflict(comments::mp_comment_id)
            .do_update()
            .set((
                comments::user_name.eq(&comment.user_name),
                comments::comment_text.eq(&comment.comment_text),
                comments::commented_at.eq(comment.commented_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Batch-loads routes by id (spec §4.1: `RoutesByIDs`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn routes_by_ids(&self, ids: &[i64]) -> Result<Vec<Route>, Error> {
        let mut conn = self.pool.get().await?;
        let rows = routes::table
            .filter(routes::mp_route_id.eq_any(ids))
            .select((
                routes::mp_route_id,
                routes::mp_area_id,
                routes::name,
                routes::route_type,
                routes::rating,
                routes::location_id,
                routes::latitude,
                routes::longitude,
                routes::aspect,
                routes::created_at,
                routes::updated_at,
            ))
            .load::<RouteRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Returns every area id in the subtree rooted at `area_id`
    /// (inclusive), following `parent_mp_area_id` via a depth-capped
    /// recursive query (spec §4.1, §9 design note on recursive area
    /// trees).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn area_subtree_ids(&self, area_id: i64) -> Result<Vec<i64>, Error> {
        let mut conn = self.pool.get().await?;
        let rows = diesel::sql_query(
            "WITH RECURSIVE descendants(mp_area_id, depth) AS ( \
                 SELECT mp_area_id, 0 FROM areas WHERE mp_area_id = $1 \
                 UNION ALL \
                 SELECT a.mp_area_id, d.depth + 1 \
                 FROM areas a JOIN descendants d ON a.parent_mp_area_id = d.mp_area_id \
                 WHERE d.depth < $2 \
             ) SELECT mp_area_id FROM descendants",
        )
        .bind::<BigInt, _>(area_id)
        .bind::<BigInt, _>(MAX_TREE_DEPTH)
        .load::<AreaIdRow>(&mut conn)
        .await?;
        Ok(rows.into_iter().map(|r| r.mp_area_id).collect())
    }

    /// Route ids belonging to an area, optionally including the whole
    /// subtree (spec §4.1: `RouteIDsForArea`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn route_ids_for_area(
        &self,
        area_id: i64,
        recursive: bool,
    ) -> Result<Vec<i64>, Error> {
        let area_ids = if recursive {
            self.area_subtree_ids(area_id).await?
        } else {
            vec![area_id]
        };
        let mut conn = self.pool.get().await?;
        let ids = routes::table
            .filter(routes::mp_area_id.eq_any(area_ids))
            .select(routes::mp_route_id)
            .load::<i64>(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Route ids bound to a first-party location (spec §4.1:
    /// `RouteIDsForLocation`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn route_ids_for_location(&self, location_id: i32) -> Result<Vec<i64>, Error> {
        let mut conn = self.pool.get().await?;
        let ids = routes::table
            .filter(routes::location_id.eq(location_id))
            .select(routes::mp_route_id)
            .load::<i64>(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Routes with GPS within an area, optionally including the whole
    /// subtree (spec §4.1: `RoutesWithGPSInArea`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn routes_with_gps_in_area(
        &self,
        area_id: i64,
        recursive: bool,
    ) -> Result<Vec<Route>, Error> {
        let area_ids = if recursive {
            self.area_subtree_ids(area_id).await?
        } else {
            vec![area_id]
        };
        let mut conn = self.pool.get().await?;
        let rows = routes::table
            .filter(
                routes::mp_area_id
                    .eq_any(area_ids)
                    .and(routes::latitude.is_not_null())
                    .and(routes::longitude.is_not_null()),
            )
            .select((
                routes::mp_route_id,
                routes::mp_area_id,
                routes::name,
                routes::route_type,
                routes::rating,
                routes::location_id,
                routes::latitude,
                routes::longitude,
                routes::aspect,
                routes::created_at,
                routes::updated_at,
            ))
            .load::<RouteRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// The cached child-route count for an area, or `None` if the area
    /// has never been checked — the sentinel that seeds new-route
    /// discovery (spec §4.1, §4.4.4 step 2).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn route_count(&self, area_id: i64) -> Result<Option<i32>, Error> {
        let mut conn = self.pool.get().await?;
        areas::table
            .filter(areas::mp_area_id.eq(area_id))
            .select(areas::route_count)
            .first::<Option<i32>>(&mut conn)
            .await
            .optional()
            .map(Option::flatten)
            .map_err(Error::from)
    }

    /// Updates the cached child-route count and checked-at timestamp
    /// for an area (spec §4.1: `UpdateRouteCount`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn update_route_count(&self, area_id: i64, count: i32) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        diesel::update(areas::table.filter(areas::mp_area_id.eq(area_id)))
            .set((
                areas::route_count.eq(count),
                areas::last_checked_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Loads a single area by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn area_by_id(&self, area_id: i64) -> Result<Option<Area>, Error> {
        let mut conn = self.pool.get().await?;
        let row = areas::table
            .filter(areas::mp_area_id.eq(area_id))
            .select((
                areas::mp_area_id,
                areas::name,
                areas::parent_mp_area_id,
                areas::area_type,
                areas::location_id,
                areas::latitude,
                areas::longitude,
                areas::last_synced_at,
                areas::route_count,
                areas::last_checked_at,
            ))
            .first::<AreaRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Into::into))
    }

    /// Child area ids directly under `area_id` (one level, not the full
    /// subtree).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn child_area_ids(&self, area_id: i64) -> Result<Vec<i64>, Error> {
        let mut conn = self.pool.get().await?;
        let ids = areas::table
            .filter(areas::parent_mp_area_id.eq(area_id))
            .select(areas::mp_area_id)
            .load::<i64>(&mut conn)
            .await?;
        Ok(ids)
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
