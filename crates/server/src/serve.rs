//! `serve` subcommand: the HTTP frontend, optionally with the worker in-process.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use courier_broker::{ActivityLog, Broker, MemoryBroker, RedisBroker};
use courier_core::Config;
use courier_queue::{shutdown_signal, DigestProcessor, WorkerLoop, WorkerSettings};

use crate::router::build_router;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub embedded_worker: bool,
    pub in_memory: bool,
    pub top_k: usize,
}

pub async fn serve(config: &Config, options: ServeOptions) -> anyhow::Result<()> {
    config.log_summary();

    let broker: Arc<dyn Broker> = if options.in_memory {
        info!("using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(RedisBroker::connect(&config.redis).await?)
    };

    let state = Arc::new(AppState::new(broker.clone(), config));
    state.activity.record("Starting web service...").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = options.embedded_worker.then(|| {
        let activity = ActivityLog::new(broker.clone(), &config.log, "model_server");
        let worker = WorkerLoop::new(
            broker.clone(),
            Arc::new(DigestProcessor::new(options.top_k)),
            WorkerSettings::from(&config.queue),
        )
        .with_activity_log(activity);
        info!("embedded worker enabled");
        tokio::spawn(worker.run(shutdown_rx))
    });

    let app = build_router(state.clone());
    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = shutdown_signal().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await?;

    if let Some(handle) = worker {
        let _ = shutdown_tx.send(true);
        let stats = handle.await?;
        info!(processed = stats.processed, failed = stats.failed, "embedded worker stopped");
    }
    state.activity.record("Web service stopped").await;

    Ok(())
}
