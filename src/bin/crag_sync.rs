//! Operational command surface (spec §6): `sync-root`, `recompute-priorities`,
//! `sync-ticks`, `sync-comments`, `discover-new`, `job-status`, plus a
//! `serve` command that runs the scheduler loop. Exits non-zero on
//! failure.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crag_sync::{
    config::Config, upstream::ReqwestUpstreamClient, CancelToken, Classifier, Database, JobKind,
    JobMonitor, RateGovernor, Scheduler, SyncKind, SyncPipeline, SyncSelector, SyncTier,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crag-sync", about = "Climbing-route catalog sync engine")]
struct Cli {
    #[arg(long, default_value = "crag-sync.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TierArg {
    High,
    Medium,
    Low,
}

impl From<TierArg> for SyncTier {
    fn from(t: TierArg) -> Self {
        match t {
            TierArg::High => SyncTier::High,
            TierArg::Medium => SyncTier::Medium,
            TierArg::Low => SyncTier::Low,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Full recursive sync from a root area id.
    SyncRoot {
        area_id: i64,
        #[arg(long)]
        location: Option<i32>,
    },
    /// Recompute sync tiers for every non-location route.
    RecomputePriorities,
    /// Sync ticks for a tier or the location-bound set.
    SyncTicks {
        #[arg(long, group = "scope")]
        tier: Option<TierArg>,
        #[arg(long, group = "scope")]
        location: bool,
    },
    /// Sync comments for a tier or the location-bound set.
    SyncComments {
        #[arg(long, group = "scope")]
        tier: Option<TierArg>,
        #[arg(long, group = "scope")]
        location: bool,
    },
    /// Count-delta new-route discovery over all active state configs.
    DiscoverNew,
    /// Print the latest execution of a named job.
    JobStatus { name: String },
    /// Run the scheduler and block until terminated.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crag_sync=info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("failed to load configuration")?;

    let db = Database::new(
        &config.database.url,
        &config.database.extra_root_ca,
        config.database.max_size,
        config.database.min_idle,
    )
    .await
    .context("failed to connect to the database")?;

    let monitor = Arc::new(JobMonitor::new(db.clone()));
    monitor
        .reap_orphans()
        .await
        .context("failed to reap orphaned jobs")?;

    let governor = RateGovernor::start();
    let upstream = Arc::new(
        ReqwestUpstreamClient::new(
            &config.upstream.base_url,
            config.upstream.auth_token.as_deref(),
            governor,
        )
        .context("failed to build upstream client")?,
    );
    let pipeline = Arc::new(SyncPipeline::new(db.clone(), upstream));

    let exit_code: Result<()> = match cli.command {
        Command::SyncRoot { area_id, location } => {
            let mut progress = monitor.start("sync_root", JobKind::FullSync, None).await?;
            let cancel = CancelToken::new();
            let result = pipeline.full_sync(area_id, location, &mut progress, &cancel).await;
            finish_job("sync_root", progress, result).await
        }
        Command::RecomputePriorities => {
            let progress = monitor
                .start("recompute_priorities", JobKind::PriorityRecompute, None)
                .await?;
            let classifier = Classifier::new(&db);
            let result = classifier.recompute().await.map(|summary| {
                tracing::info!(?summary, "priority recompute finished");
            });
            finish_job("recompute_priorities", progress, result).await
        }
        Command::SyncTicks { tier, location } => {
            let selector = resolve_selector(tier, location)?;
            let mut progress = monitor.start("sync_ticks", JobKind::TickSync, None).await?;
            let cancel = CancelToken::new();
            let result = pipeline
                .tiered_sync(selector, SyncKind::Tick, &mut progress, &cancel)
                .await;
            finish_job("sync_ticks", progress, result).await
        }
        Command::SyncComments { tier, location } => {
            let selector = resolve_selector(tier, location)?;
            let mut progress = monitor.start("sync_comments", JobKind::CommentSync, None).await?;
            let cancel = CancelToken::new();
            let result = pipeline
                .tiered_sync(selector, SyncKind::Comment, &mut progress, &cancel)
                .await;
            finish_job("sync_comments", progress, result).await
        }
        Command::DiscoverNew => {
            let progress = monitor
                .start("discover_new", JobKind::NewRouteDiscovery, None)
                .await?;
            let mut result = Ok(());
            for root in db.active_state_configs().await? {
                if let Err(e) = pipeline.discover_new(root.mp_area_id).await {
                    result = Err(e);
                    break;
                }
            }
            finish_job("discover_new", progress, result).await
        }
        Command::JobStatus { name } => {
            match db.latest_job(&name).await? {
                Some(job) => {
                    println!(
                        "{} kind={} status={} processed={} success={} failure={}",
                        job.job_name,
                        job.kind,
                        job.status,
                        job.processed_count,
                        job.success_count,
                        job.failure_count
                    );
                    Ok(())
                }
                None => {
                    println!("no executions recorded for '{name}'");
                    Ok(())
                }
            }
        }
        Command::Serve => {
            let scheduler = Scheduler::start(db.clone(), pipeline.clone(), monitor.clone());
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            scheduler.shutdown();
            Ok(())
        }
    };

    if let Err(e) = exit_code {
        tracing::error!(error = %e, "command failed");
        std::process::exit(1);
    }
    Ok(())
}

fn resolve_selector(tier: Option<TierArg>, location: bool) -> Result<SyncSelector> {
    match (tier, location) {
        (Some(t), false) => Ok(SyncSelector::Tier(t.into())),
        (None, true) => Ok(SyncSelector::LocationBound),
        _ => anyhow::bail!("specify exactly one of --tier or --location"),
    }
}

/// Records a job's terminal state from its body's result (spec
/// §4.4.5 state machine) and turns a store failure into the process's
/// exit code.
async fn finish_job(
    job_name: &str,
    progress: crag_sync::ProgressReporter,
    result: Result<(), crag_sync::Error>,
) -> Result<()> {
    match result {
        Ok(()) => {
            progress.complete().await?;
            Ok(())
        }
        Err(e) => {
            progress.fail(&e.to_string()).await?;
            anyhow::bail!("{job_name} failed: {e}");
        }
    }
}
