//! courier-worker — consumes the work queue and publishes results.
//!
//! Runs one [`WorkerLoop`] with the digest processor until SIGINT/SIGTERM.
//! The job being processed when the signal arrives is finished first.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use courier_broker::{ActivityLog, Broker, RedisBroker};
use courier_core::config::{self, Config};
use courier_queue::{shutdown_signal, DigestProcessor, WorkerLoop, WorkerSettings};

// ── CLI ─────────────────────────────────────────────────────────────

/// Courier worker — runs queued jobs through the processor.
#[derive(Parser, Debug)]
#[command(name = "courier-worker", version, about)]
struct Cli {
    /// Number of predictions returned per job.
    #[arg(long, env = "COURIER_TOP_K", default_value_t = DigestProcessor::DEFAULT_TOP_K)]
    top_k: usize,

    /// Name recorded in the activity log.
    #[arg(long, env = "COURIER_WORKER_NAME", default_value = "model_server")]
    name: String,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.validate()?;
    config.log_summary();

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.redis).await?);
    let activity = ActivityLog::new(broker.clone(), &config.log, cli.name.as_str());

    let worker = WorkerLoop::new(
        broker,
        Arc::new(DigestProcessor::new(cli.top_k)),
        WorkerSettings::from(&config.queue),
    )
    .with_activity_log(activity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    if let Err(e) = shutdown_signal().await {
        warn!(error = %e, "failed to listen for shutdown signal, stopping");
    }
    info!("shutdown requested, finishing current job");
    let _ = shutdown_tx.send(true);

    let stats = handle.await?;
    info!(processed = stats.processed, failed = stats.failed, "courier-worker exited cleanly");
    Ok(())
}
