//! Gridex coordinator binary.
//!
//! Usage:
//!     gridex-coordinator --bind 0.0.0.0:7700 --dashboard-bind 127.0.0.1:7701

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gridex_coordinator::Coordinator;
use gridex_db::Store;
use gridex_protocol::config::{CoordinatorConfig, SettlePolicy};
use gridex_protocol::defaults;

#[derive(Parser, Debug)]
#[command(name = "gridex-coordinator", about = "Coordinator for the Gridex compute exchange")]
struct Args {
    /// TCP bind address for worker sessions
    #[arg(long, default_value = defaults::DEFAULT_WORKER_BIND_ADDR)]
    bind: String,

    /// TCP bind address for the dashboard API
    #[arg(long, default_value = defaults::DEFAULT_DASHBOARD_BIND_ADDR)]
    dashboard_bind: String,

    /// SQLite database URL (defaults to sqlite:~/.gridex/gridex.db)
    #[arg(long)]
    database: Option<String>,

    /// Credits granted to a fresh account
    #[arg(long, default_value_t = defaults::DEFAULT_STARTING_CREDITS)]
    starting_credits: i64,

    /// Expected worker heartbeat interval, seconds
    #[arg(long, default_value_t = defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    heartbeat_interval: u64,

    /// Silence after which a running job's worker counts as lost, seconds
    /// (defaults to 2x the heartbeat interval)
    #[arg(long)]
    stall_grace: Option<u64>,

    /// Upper bound on a job's wall-clock timeout, seconds
    #[arg(long, default_value_t = defaults::DEFAULT_MAX_TIMEOUT_SECS)]
    max_timeout: u64,

    /// Refund submitters when a job fails
    #[arg(long)]
    refund_on_failure: bool,

    /// Share of the cost refunded on a timed-out job, percent
    #[arg(long, default_value_t = defaults::DEFAULT_TIMEOUT_REFUND_PERCENT)]
    timeout_refund_percent: u8,

    /// Mirror the full log filter to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    gridex_logging::init_logging("gridex-coordinator", args.verbose)
        .context("failed to initialize logging")?;

    let db_url = args.database.clone().unwrap_or_else(default_db_url);
    let heartbeat_interval = Duration::from_secs(args.heartbeat_interval);
    let config = CoordinatorConfig {
        worker_bind: args.bind.clone(),
        dashboard_bind: args.dashboard_bind.clone(),
        db_url: db_url.clone(),
        starting_credits: args.starting_credits,
        heartbeat_interval,
        stall_grace: args
            .stall_grace
            .map(Duration::from_secs)
            .unwrap_or(heartbeat_interval * defaults::DEFAULT_STALL_GRACE_FACTOR),
        max_timeout_seconds: args.max_timeout,
        settle_policy: SettlePolicy {
            refund_on_failure: args.refund_on_failure,
            timeout_refund_percent: args.timeout_refund_percent,
        },
        ..CoordinatorConfig::default()
    };

    tracing::info!("Starting Gridex coordinator");
    tracing::info!("  Workers:   {}", config.worker_bind);
    tracing::info!("  Dashboard: {}", config.dashboard_bind);
    tracing::info!("  Database:  {}", config.db_url);

    let store = Store::open(&config.db_url)
        .await
        .context("failed to open store")?
        .with_artifact_root(gridex_logging::gridex_home().join("artifacts"));
    store.init().await.context("failed to apply schema")?;

    let coordinator = Coordinator::bind(config, store).await?;

    tokio::select! {
        result = coordinator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Coordinator shutting down");
            Ok(())
        }
    }
}

fn default_db_url() -> String {
    let home = gridex_logging::gridex_home();
    let _ = std::fs::create_dir_all(&home);
    format!("sqlite:{}", home.join("gridex.db").display())
}
