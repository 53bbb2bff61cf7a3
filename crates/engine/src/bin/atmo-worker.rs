//! atmo-worker: periodic driver for cluster lifecycle and scheduled jobs.
//!
//! Each tick resubmits deferred launches, refreshes active clusters, syncs
//! and times out runs, starts due jobs and reports stalled provisioning.
//! Every few ticks it also reconciles local state against the EMR listing.

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use atmo_core::Config;
use atmo_engine::{Atmo, Driver};
use atmo_provisioner::{ControlPlane, EmrControlPlane, NotebookStore, S3NotebookStore};
use atmo_store::{MemoryStore, Persistence, PgStore};

// ── CLI ─────────────────────────────────────────────────────────────

/// ATMO worker: EMR cluster lifecycle and recurring notebook jobs.
#[derive(Parser, Debug)]
#[command(name = "atmo-worker", version, about)]
struct Cli {
    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,

    /// Override the tick interval in seconds.
    #[arg(long, env = "ATMO_TICK_SECONDS")]
    tick_interval: Option<u64>,

    /// Override the reconciliation cadence (every N ticks).
    #[arg(long, env = "ATMO_RECONCILE_EVERY")]
    reconcile_every: Option<u32>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    atmo_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(secs) = cli.tick_interval {
        config.scheduler.tick_interval_secs = secs.max(1);
    }
    if let Some(n) = cli.reconcile_every {
        config.scheduler.reconcile_every_ticks = n.max(1);
    }
    config.log_summary();

    let store: Arc<dyn Persistence> = if config.postgres.is_configured() {
        let pg = PgStore::connect(&config.postgres).await?;
        info!(host = %config.postgres.host, db = %config.postgres.database, "PostgreSQL store connected");
        Arc::new(pg)
    } else {
        warn!("PG_USERNAME not set, using in-memory store; state is lost on exit");
        Arc::new(MemoryStore::new())
    };

    let control_plane: Arc<dyn ControlPlane> =
        Arc::new(EmrControlPlane::new(&config.aws, &config.emr).await);
    let notebooks: Arc<dyn NotebookStore> =
        Arc::new(S3NotebookStore::new(&config.aws, &config.emr).await);

    let atmo = Arc::new(Atmo::new(config, store, control_plane, notebooks));
    let mut driver = Driver::new(atmo);

    if cli.once {
        let report = driver.tick(Utc::now()).await;
        info!(?report, "Single tick finished");
        return Ok(());
    }

    info!("atmo-worker starting");
    driver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;
    info!("atmo-worker exited cleanly");
    Ok(())
}
