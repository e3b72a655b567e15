use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use common::{
    config::{ConnectionArgs, ConnectionConfig},
    db::MongoStore,
};
use log::{error, info};
use tokio::{select, time::MissedTickBehavior};

mod sweep;
use sweep::{sweep, SweepConfig};

/// Periodically fails stalled uploads and deletes finished ones past retention.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Seconds between sweeps
    #[arg(long, env = "FILEUPLOADER_SWEEP_INTERVAL", default_value_t = 30)]
    interval: u64,

    /// Seconds a PROCESSING upload may go without an update
    #[arg(long, env = "FILEUPLOADER_STALLED_AFTER", default_value_t = 1800)]
    stalled_after: u64,

    /// Days to keep COMPLETED and FAILED uploads
    #[arg(long, env = "FILEUPLOADER_RETENTION_DAYS", default_value_t = 30)]
    retention_days: u64,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

const DAY_SECS: u64 = 24 * 60 * 60;

impl Args {
    fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            stalled_after: Duration::from_secs(self.stalled_after),
            retention: Duration::from_secs(self.retention_days.saturating_mul(DAY_SECS)),
        }
    }
}

async fn run(store: &MongoStore, config: &SweepConfig) {
    match sweep(store, config).await {
        Ok(report) if report.is_empty() => {}
        Ok(report) => info!(
            "sweep: {} stalled, {} purged, {} orphans, {} errors",
            report.stalled, report.purged, report.orphans, report.errors
        ),
        Err(e) => error!("sweep aborted: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.sweep_config();
    let connection = ConnectionConfig::from(args.connection);

    let store = MongoStore::connect(&connection).await?;
    info!("connected to {}", connection.target());

    if args.once {
        run(&store, &config).await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        select! {
            _ = ticker.tick() => run(&store, &config).await,
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
