//! Crash-safe job progress: start, periodic flush, terminal state (spec
//! §4.6). `JobMonitor` owns orphan detection; `ProgressReporter`
//! batches per-item outcomes so a job of hundreds of thousands of
//! routes doesn't write one row per item.

use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use serde_json::Value;

use crate::{
    job::{JobExecution, JobKind},
    store::Database,
    Error,
};

const DEFAULT_FLUSH_EVERY: u64 = 10;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

fn default_orphan_grace() -> ChronoDuration {
    ChronoDuration::hours(2)
}

/// Observes the `job_executions` table across process restarts.
#[derive(Clone)]
pub struct JobMonitor {
    db: Database,
}

impl JobMonitor {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Closes any stale `running` rows before new jobs start (spec
    /// §4.4.6, §4.6, §8 property 9). Call once at process startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn reap_orphans(&self) -> Result<u64, Error> {
        self.db.reap_orphaned_jobs(default_orphan_grace()).await
    }

    /// Starts a job and returns a reporter for its progress. Enforces
    /// the single-flight invariant (spec §8 property 6): returns
    /// `Error::AlreadyInProgress` if `job_name` is already running.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyInProgress` or a query error.
    pub async fn start(
        &self,
        job_name: &str,
        kind: JobKind,
        target_count: Option<i64>,
    ) -> Result<ProgressReporter, Error> {
        let job = self.db.start_job(job_name, kind, target_count).await?;
        Ok(ProgressReporter::new(self.db.clone(), job))
    }
}

/// Accumulates per-item outcomes for a single job run and flushes them
/// every `flush_every` items or `flush_interval`, whichever comes
/// first — plus a final flush on `complete`/`fail` (spec §4.6).
pub struct ProgressReporter {
    db: Database,
    job: JobExecution,
    processed: i64,
    success: i64,
    failure: i64,
    since_flush: u64,
    last_flush: Instant,
    flush_every: u64,
    flush_interval: Duration,
}

impl ProgressReporter {
    fn new(db: Database, job: JobExecution) -> Self {
        Self {
            db,
            job,
            processed: 0,
            success: 0,
            failure: 0,
            since_flush: 0,
            last_flush: Instant::now(),
            flush_every: DEFAULT_FLUSH_EVERY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    #[must_use]
    pub fn job_id(&self) -> i64 {
        self.job.id
    }

    /// Records one item succeeding, flushing if due (spec §8 property
    /// 8: `processed_count` never decreases).
    ///
    /// # Errors
    ///
    /// Returns an error if a due flush fails to write.
    pub async fn record_success(&mut self, current_item: Option<Value>) -> Result<(), Error> {
        self.processed += 1;
        self.success += 1;
        self.maybe_flush(current_item).await
    }

    /// Records one item failing, flushing if due.
    ///
    /// # Errors
    ///
    /// Returns an error if a due flush fails to write.
    pub async fn record_failure(&mut self, current_item: Option<Value>) -> Result<(), Error> {
        self.processed += 1;
        self.failure += 1;
        self.maybe_flush(current_item).await
    }

    async fn maybe_flush(&mut self, current_item: Option<Value>) -> Result<(), Error> {
        self.since_flush += 1;
        let due = self.since_flush >= self.flush_every || self.last_flush.elapsed() >= self.flush_interval;
        if due {
            self.flush(current_item).await?;
        }
        Ok(())
    }

    /// Writes current counters unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn flush(&mut self, current_item: Option<Value>) -> Result<(), Error> {
        self.db
            .update_job_progress(self.job.id, self.processed, self.success, self.failure, current_item)
            .await?;
        self.since_flush = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Final flush, then terminal `completed` state.
    ///
    /// A job with every item failed and at least one item attempted is
    /// still reported `completed` here: spec §4.4.6 reserves `failed`
    /// for "every item failed **or** the job was cancelled" as a whole,
    /// which callers should check via `success + failure` before
    /// calling this versus `fail`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn complete(mut self) -> Result<(), Error> {
        self.flush(None).await?;
        self.db.complete_job(self.job.id).await
    }

    /// Final flush, then terminal `failed` state with `reason` (spec
    /// §4.4.5 state machine; use `reason = "cancelled"` for
    /// cancellation per spec §5).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn fail(mut self, reason: &str) -> Result<(), Error> {
        self.flush(None).await?;
        self.db.fail_job(self.job.id, reason).await
    }

    #[must_use]
    pub fn processed_count(&self) -> i64 {
        self.processed
    }

    #[must_use]
    pub fn success_count(&self) -> i64 {
        self.success
    }

    #[must_use]
    pub fn failure_count(&self) -> i64 {
        self.failure
    }

    /// Whether every processed item failed — the caller's signal to
    /// call `fail` instead of `complete` (spec §4.4.6).
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.processed > 0 && self.success == 0
    }
}
