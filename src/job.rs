//! Job execution records: crash-safe start / heartbeat / complete / fail
//! state for every sync and classifier run (spec §3 "Job execution",
//! §4.4.5 state machine).

use chrono::{NaiveDateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, Queryable};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{schema::job_executions, store::Database, Error};

/// What kind of work a job execution performed. Drives which pipeline
/// entry point `job-status` output and the scheduler associate with a
/// row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    FullSync,
    TickSync,
    CommentSync,
    NewRouteDiscovery,
    PriorityRecompute,
}

/// The job state machine in spec §4.4.5:
/// `idle -> running -> {completed, failed}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Queryable)]
pub struct JobExecution {
    pub id: i64,
    pub job_name: String,
    pub kind: String,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub target_count: Option<i64>,
    pub processed_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub status: String,
    pub error: Option<String>,
    pub current_item: Option<serde_json::Value>,
}

impl JobExecution {
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Failed)
    }
}

impl Database {
    /// Starts a job, enforcing the single-flight invariant: at most one
    /// `running` row per `job_name` at a time (spec §4.4.5, §8 property
    /// 6). The invariant is enforced by a partial unique index in the
    /// schema; a conflict here means another instance is already
    /// running and this call returns `Error::AlreadyInProgress` rather
    /// than a generic query error (spec §7: "not an error in the
    /// classical sense").
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyInProgress` if the job is already running,
    /// or an error if the query otherwise fails.
    pub async fn start_job(
        &self,
        job_name: &str,
        kind: JobKind,
        target_count: Option<i64>,
    ) -> Result<JobExecution, Error> {
        let mut conn = self.pool().get().await?;
        let result = diesel::insert_into(job_executions::table)
            .values((
                job_executions::job_name.eq(job_name),
                job_executions::kind.eq(kind.to_string()),
                job_executions::started_at.eq(Utc::now().naive_utc()),
                job_executions::target_count.eq(target_count),
                job_executions::status.eq(JobStatus::Running.to_string()),
            ))
            .get_result::<JobExecution>(&mut conn)
            .await;

        match result {
            Ok(job) => Ok(job),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(Error::AlreadyInProgress(job_name.to_string()))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    /// The currently-`running` row for a job name, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn running_job(&self, job_name: &str) -> Result<Option<JobExecution>, Error> {
        let mut conn = self.pool().get().await?;
        job_executions::table
            .filter(job_executions::job_name.eq(job_name))
            .filter(job_executions::status.eq(JobStatus::Running.to_string()))
            .first::<JobExecution>(&mut conn)
            .await
            .optional()
            .map_err(Error::from)
    }

    /// The most recent execution of a job, running or not — backs the
    /// `job-status` operational command (spec §6).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn latest_job(&self, job_name: &str) -> Result<Option<JobExecution>, Error> {
        let mut conn = self.pool().get().await?;
        job_executions::table
            .filter(job_executions::job_name.eq(job_name))
            .order_by(job_executions::started_at.desc())
            .first::<JobExecution>(&mut conn)
            .await
            .optional()
            .map_err(Error::from)
    }

    /// Flushes progress counters and optional current-item telemetry
    /// (spec §4.6).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn update_job_progress(
        &self,
        id: i64,
        processed_count: i64,
        success_count: i64,
        failure_count: i64,
        current_item: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let mut conn = self.pool().get().await?;
        diesel::update(job_executions::table.filter(job_executions::id.eq(id)))
            .set((
                job_executions::processed_count.eq(processed_count),
                job_executions::success_count.eq(success_count),
                job_executions::failure_count.eq(failure_count),
                job_executions::current_item.eq(current_item),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Marks a job `completed` (spec §4.4.5 state machine).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn complete_job(&self, id: i64) -> Result<(), Error> {
        let mut conn = self.pool().get().await?;
        diesel::update(job_executions::table.filter(job_executions::id.eq(id)))
            .set((
                job_executions::status.eq(JobStatus::Completed.to_string()),
                job_executions::ended_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Marks a job `failed` with a reason (spec §4.4.5, §4.4.6); used
    /// for normal failures, cancellation (`reason = "cancelled"`), and
    /// orphan cleanup (`reason = "orphaned"`).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn fail_job(&self, id: i64, reason: &str) -> Result<(), Error> {
        let mut conn = self.pool().get().await?;
        diesel::update(job_executions::table.filter(job_executions::id.eq(id)))
            .set((
                job_executions::status.eq(JobStatus::Failed.to_string()),
                job_executions::ended_at.eq(Utc::now().naive_utc()),
                job_executions::error.eq(reason),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Closes any `running` row older than `grace` as
    /// `failed('orphaned')` (spec §4.4.6, §4.6: orphan detection on
    /// startup; §8 property 9).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn reap_orphaned_jobs(&self, grace: chrono::Duration) -> Result<u64, Error> {
        let mut conn = self.pool().get().await?;
        let cutoff = Utc::now().naive_utc() - grace;
        let affected = diesel::update(
            job_executions::table
                .filter(job_executions::status.eq(JobStatus::Running.to_string()))
                .filter(job_executions::started_at.lt(cutoff)),
        )
        .set((
            job_executions::status.eq(JobStatus::Failed.to_string()),
            job_executions::ended_at.eq(Utc::now().naive_utc()),
            job_executions::error.eq("orphaned"),
        ))
        .execute(&mut conn)
        .await?;
        if affected > 0 {
            tracing::warn!(count = affected, "reaped orphaned job executions");
        }
        Ok(affected as u64)
    }
}
