//! Local mirror of an external climbing-route catalog.
//!
//! The crate's hard engineering is the sync and priority engine: it
//! decides which routes to refresh, when, and in what order, under a
//! strict upstream rate limit. See `classifier`, `pipeline`,
//! `scheduler`, and `governor` for the pieces that make that decision.

mod backends;
mod classifier;
pub mod config;
mod date_policy;
mod governor;
mod job;
mod monitor;
mod pipeline;
mod query;
mod scheduler;
mod schema;
mod state_config;
mod store;
mod sync_metadata;
pub mod types;
pub mod upstream;

pub use backends::MIGRATIONS;
pub use classifier::{ClassificationSummary, Classifier, RouteMetrics};
pub use date_policy::sanitize_climbed_at;
pub use governor::RateGovernor;
pub use job::{JobExecution, JobKind, JobStatus};
pub use monitor::{JobMonitor, ProgressReporter};
pub use pipeline::{CancelToken, DiscoverySummary, SyncPipeline};
pub use query::{AreaActivity, RouteActivity, SearchHit};
pub use scheduler::Scheduler;
pub use state_config::StateConfig;
pub use store::Database;
pub use sync_metadata::{RouteSyncMetadata, SyncKind, SyncSelector};
pub use types::{
    Area, AreaKind, Aspect, Comment, CommentTarget, Route, RouteType, RouteTypes, SyncTier, Tick,
};

use thiserror::Error;

/// The crate's closed error taxonomy.
///
/// Per-item upstream and parsing failures are handled inside the sync
/// pipeline (logged and counted, never propagated as an `Error`); this
/// enum covers the failures that abort a query, a job, or the process,
/// per the error taxonomy in the design document.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("upstream catalog error: {0}")]
    Upstream(String),
    #[error("job '{0}' is already in progress")]
    AlreadyInProgress(String),
    #[error("job was cancelled")]
    Cancelled,
}
