//! The small table of root areas the sync engine is configured to
//! mirror (spec §3 "State configuration").

use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};

use crate::{schema::state_configs, store::Database, Error};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, diesel::Queryable)]
pub struct StateConfig {
    pub state_name: String,
    pub mp_area_id: i64,
    pub is_active: bool,
}

impl Database {
    /// All configured root areas, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn state_configs(&self) -> Result<Vec<StateConfig>, Error> {
        let mut conn = self.pool().get().await?;
        state_configs::table
            .load::<StateConfig>(&mut conn)
            .await
            .map_err(Error::from)
    }

    /// The active root areas enumerated at startup to seed the full
    /// sync and tiered periodic sync (spec §4.4.1, §4.4.5).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn active_state_configs(&self) -> Result<Vec<StateConfig>, Error> {
        let mut conn = self.pool().get().await?;
        state_configs::table
            .filter(state_configs::is_active.eq(true))
            .load::<StateConfig>(&mut conn)
            .await
            .map_err(Error::from)
    }

    /// Registers or updates a root area to mirror.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn upsert_state_config(
        &self,
        state_name: &str,
        mp_area_id: i64,
        is_active: bool,
    ) -> Result<(), Error> {
        let mut conn = self.pool().get().await?;
        diesel::insert_into(state_configs::table)
            .values((
                state_configs::state_name.eq(state_name),
                state_configs::mp_area_id.eq(mp_area_id),
                state_configs::is_active.eq(is_active),
            ))
            .on_conflict(state_configs::state_name)
            .do_update()
            .set((
                state_configs::mp_area_id.eq(mp_area_id),
                state_configs::is_active.eq(is_active),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
