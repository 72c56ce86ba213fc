//! Periodic triggers (spec §4.5): each independently-configurable
//! cadence runs as its own background task, the way `retention_enforcer`
//! spawns its enforcement loop — a `tokio::time::interval` per
//! concern, not a single cron-style dispatcher.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    classifier::Classifier,
    job::JobKind,
    monitor::JobMonitor,
    pipeline::{CancelToken, SyncPipeline},
    store::Database,
    sync_metadata::{SyncKind, SyncSelector},
    types::SyncTier,
    Error,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Owns the background trigger tasks for one process. Dropping it does
/// not stop the tasks (they are detached, matching `spawn_retention_enforcer`'s
/// fire-and-forget shape) — call [`Scheduler::shutdown`] to cooperatively
/// stop them instead.
pub struct Scheduler {
    cancel: CancelToken,
}

impl Scheduler {
    /// Spawns every trigger in spec §4.5's table, each respecting the
    /// per-job single-flight invariant via [`JobMonitor::start`].
    #[must_use]
    pub fn start(db: Database, pipeline: Arc<SyncPipeline>, monitor: Arc<JobMonitor>) -> Self {
        let cancel = CancelToken::new();

        spawn_trigger(
            "priority_recompute",
            DAY,
            true,
            cancel.clone(),
            monitor.clone(),
            JobKind::PriorityRecompute,
            None,
            {
                let db = db.clone();
                move || {
                    let db = db.clone();
                    Box::pin(async move {
                        let classifier = Classifier::new(&db);
                        classifier.recompute().await.map(|_| ())
                    })
                }
            },
        );

        spawn_tiered_trigger(
            "location_tick_sync",
            DAY,
            cancel.clone(),
            monitor.clone(),
            pipeline.clone(),
            SyncSelector::LocationBound,
            SyncKind::Tick,
        );
        spawn_tiered_trigger(
            "location_comment_sync",
            DAY,
            cancel.clone(),
            monitor.clone(),
            pipeline.clone(),
            SyncSelector::LocationBound,
            SyncKind::Comment,
        );
        spawn_tiered_trigger(
            "high_tier_sync",
            DAY,
            cancel.clone(),
            monitor.clone(),
            pipeline.clone(),
            SyncSelector::Tier(SyncTier::High),
            SyncKind::Tick,
        );
        spawn_tiered_trigger(
            "medium_tier_sync",
            WEEK,
            cancel.clone(),
            monitor.clone(),
            pipeline.clone(),
            SyncSelector::Tier(SyncTier::Medium),
            SyncKind::Tick,
        );
        spawn_tiered_trigger(
            "low_tier_sync",
            MONTH,
            cancel.clone(),
            monitor.clone(),
            pipeline.clone(),
            SyncSelector::Tier(SyncTier::Low),
            SyncKind::Tick,
        );

        spawn_trigger(
            "new_route_discovery",
            DAY,
            false,
            cancel.clone(),
            monitor.clone(),
            JobKind::NewRouteDiscovery,
            None,
            {
                let db = db.clone();
                let pipeline = pipeline.clone();
                move || {
                    let db = db.clone();
                    let pipeline = pipeline.clone();
                    Box::pin(async move {
                        let roots = db.active_state_configs().await?;
                        for root in roots {
                            pipeline.discover_new(root.mp_area_id).await?;
                        }
                        Ok(())
                    })
                }
            },
        );

        Self { cancel }
    }

    /// Signals every trigger task to stop at its next loop head.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

type TriggerFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

use std::future::Future;
use std::pin::Pin;

fn spawn_trigger<F>(
    job_name: &'static str,
    cadence: Duration,
    run_on_startup: bool,
    cancel: CancelToken,
    monitor: Arc<JobMonitor>,
    kind: JobKind,
    target_count: Option<i64>,
    make_future: F,
) where
    F: Fn() -> TriggerFuture + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cadence);
        if !run_on_startup {
            interval.tick().await;
        }
        loop {
            interval.tick().await;
            if cancel.is_cancelled() {
                return;
            }
            run_once(job_name, &monitor, kind, target_count, &make_future).await;
        }
    });
}

async fn run_once<F>(
    job_name: &str,
    monitor: &Arc<JobMonitor>,
    kind: JobKind,
    target_count: Option<i64>,
    make_future: &F,
) where
    F: Fn() -> TriggerFuture,
{
    let reporter = match monitor.start(job_name, kind, target_count).await {
        Ok(r) => r,
        Err(Error::AlreadyInProgress(_)) => {
            tracing::debug!(job_name, "skipping trigger: already in progress");
            return;
        }
        Err(e) => {
            tracing::error!(job_name, error = %e, "failed to start job");
            return;
        }
    };

    match make_future().await {
        Ok(()) => {
            if let Err(e) = reporter.complete().await {
                tracing::error!(job_name, error = %e, "failed to record job completion");
            }
        }
        Err(e) => {
            tracing::error!(job_name, error = %e, "job failed");
            if let Err(e) = reporter.fail(&e.to_string()).await {
                tracing::error!(job_name, error = %e, "failed to record job failure");
            }
        }
    }
}

fn spawn_tiered_trigger(
    job_name: &'static str,
    cadence: Duration,
    cancel: CancelToken,
    monitor: Arc<JobMonitor>,
    pipeline: Arc<SyncPipeline>,
    selector: SyncSelector,
    kind: SyncKind,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cadence);
        interval.tick().await;
        loop {
            interval.tick().await;
            if cancel.is_cancelled() {
                return;
            }

            let job_kind = match kind {
                SyncKind::Tick => JobKind::TickSync,
                SyncKind::Comment => JobKind::CommentSync,
            };
            let mut reporter = match monitor.start(job_name, job_kind, None).await {
                Ok(r) => r,
                Err(Error::AlreadyInProgress(_)) => continue,
                Err(e) => {
                    tracing::error!(job_name, error = %e, "failed to start job");
                    continue;
                }
            };
            let result = pipeline
                .tiered_sync(selector, kind, &mut reporter, &cancel)
                .await;
            match result {
                Ok(()) if reporter.all_failed() => {
                    let _ = reporter.fail("all items failed").await;
                }
                Ok(()) => {
                    let _ = reporter.complete().await;
                }
                Err(Error::Cancelled) => {
                    let _ = reporter.fail("cancelled").await;
                }
                Err(e) => {
                    tracing::error!(job_name, error = %e, "tiered sync job failed");
                    let _ = reporter.fail(&e.to_string()).await;
                }
            }
        }
    });
}
