//! CLI argument parsing and subcommand dispatch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use courier_core::Config;

use crate::{ops, serve, stress};

/// Courier HTTP frontend and operator tools.
#[derive(Parser, Debug)]
#[command(name = "courier-server", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server.
    Serve {
        /// Also run the worker loop inside this process.
        #[arg(long)]
        embedded_worker: bool,

        /// Use the in-process broker instead of Redis (single-process mode).
        #[arg(long, requires = "embedded_worker")]
        in_memory: bool,

        /// Predictions returned per job by the embedded worker.
        #[arg(long, env = "COURIER_TOP_K", default_value_t = courier_queue::DigestProcessor::DEFAULT_TOP_K)]
        top_k: usize,
    },

    /// Check the broker connection: PING, then set/get/delete a probe key.
    Ping,

    /// Print recent activity log entries, oldest first.
    Logs {
        #[arg(default_value_t = 20)]
        count: usize,
    },

    /// Fire concurrent prediction requests at a running server.
    Stress {
        /// Number of requests.
        #[arg(long, default_value_t = 10)]
        requests: usize,

        /// Delay between starting consecutive requests.
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,

        /// File whose bytes are sent as every request's payload.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Endpoint to hit. Defaults to the configured local port.
        #[arg(long)]
        url: Option<String>,

        /// Per-request HTTP timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

pub async fn dispatch(config: Config, cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve {
            embedded_worker,
            in_memory,
            top_k,
        } => {
            let options = serve::ServeOptions {
                embedded_worker,
                in_memory,
                top_k,
            };
            serve::serve(&config, options).await
        }
        Command::Ping => ops::ping(&config).await,
        Command::Logs { count } => ops::print_logs(&config, count).await,
        Command::Stress {
            requests,
            interval_ms,
            file,
            url,
            timeout_secs,
        } => {
            let url = url.unwrap_or_else(|| format!("http://localhost:{}/predict", config.server.port));
            let options = stress::StressOptions {
                url,
                requests,
                interval: std::time::Duration::from_millis(interval_ms),
                payload: match file {
                    Some(path) => Some(tokio::fs::read(&path).await?),
                    None => None,
                },
                timeout: std::time::Duration::from_secs(timeout_secs),
            };
            let summary = stress::run(&options).await?;
            println!("[INFO] All requests completed: {summary}");
            Ok(())
        }
    }
}
