//! `stress` subcommand: concurrent `POST /predict` load against a running server.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::api::PredictResponse;

#[derive(Debug, Clone)]
pub struct StressOptions {
    pub url: String,
    pub requests: usize,
    /// Delay between starting consecutive requests.
    pub interval: Duration,
    /// Shared payload; `None` sends a distinct synthetic payload per request.
    pub payload: Option<Vec<u8>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StressSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

impl fmt::Display for StressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok, {} failed in {}ms",
            self.succeeded, self.failed, self.elapsed_ms
        )
    }
}

fn payload_for(options: &StressOptions, n: usize) -> Vec<u8> {
    match &options.payload {
        Some(payload) => payload.clone(),
        None => format!("stress-request-{n}").into_bytes(),
    }
}

/// Start `requests` requests spaced by `interval`, wait for all of them and
/// print each outcome.
pub async fn run(options: &StressOptions) -> anyhow::Result<StressSummary> {
    let client = reqwest::Client::builder().timeout(options.timeout).build()?;
    let started = Instant::now();

    let mut handles = Vec::with_capacity(options.requests);
    for n in 0..options.requests {
        let client = client.clone();
        let url = options.url.clone();
        let payload = payload_for(options, n);
        handles.push(tokio::spawn(async move { call_predict(&client, &url, payload, n).await }));
        if n + 1 < options.requests {
            tokio::time::sleep(options.interval).await;
        }
    }

    let mut summary = StressSummary::default();
    for handle in handles {
        match handle.await {
            Ok(true) => summary.succeeded += 1,
            _ => summary.failed += 1,
        }
    }
    summary.elapsed_ms = started.elapsed().as_millis();
    Ok(summary)
}

async fn call_predict(client: &reqwest::Client, url: &str, payload: Vec<u8>, n: usize) -> bool {
    let response = match client.post(url).body(payload).send().await {
        Ok(response) => response,
        Err(e) => {
            println!("[INFO] request {n} FAILED - Request error: {e}");
            return false;
        }
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            println!("[INFO] request {n} FAILED - Could not read body: {e}");
            return false;
        }
    };
    debug!(request = n, status = %status, "response received");

    let body: PredictResponse = match serde_json::from_str(&text) {
        Ok(body) => body,
        Err(_) => {
            println!("[INFO] request {n} FAILED - Invalid JSON response");
            println!("  Status code: {status}");
            println!("  Response: {}", text.chars().take(100).collect::<String>());
            return false;
        }
    };

    if !body.success {
        println!("[INFO] request {n} FAILED");
        println!("  Error: {}", body.error.as_deref().unwrap_or("unknown"));
        return false;
    }

    println!("[INFO] request {n} OK");
    for (i, prediction) in body.predictions.unwrap_or_default().iter().enumerate() {
        println!("{}. {}: {:.4}", i + 1, prediction.label, prediction.probability);
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::watch;

    use courier_broker::{Broker, MemoryBroker};
    use courier_core::Config;
    use courier_queue::{DigestProcessor, WorkerLoop, WorkerSettings};

    use super::*;
    use crate::router::build_router;
    use crate::state::AppState;

    /// Serve the real router with an embedded worker on an ephemeral port.
    async fn start_server(config: &Config) -> (String, watch::Sender<bool>) {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(
            broker.clone(),
            Arc::new(DigestProcessor::default()),
            WorkerSettings::from(&config.queue),
        );
        tokio::spawn(worker.run(rx));

        let app = build_router(Arc::new(AppState::new(broker, config)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/predict"), tx)
    }

    #[tokio::test]
    async fn all_requests_succeed_against_live_server() {
        let mut config = Config::default();
        config.queue.dequeue_wait = Duration::from_millis(50);
        let (url, _worker) = start_server(&config).await;

        let options = StressOptions {
            url,
            requests: 5,
            interval: Duration::from_millis(10),
            payload: None,
            timeout: Duration::from_secs(10),
        };
        let summary = run(&options).await.unwrap();
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn unreachable_server_counts_failures() {
        let options = StressOptions {
            url: "http://127.0.0.1:9/predict".into(),
            requests: 2,
            interval: Duration::from_millis(1),
            payload: Some(b"cat.png".to_vec()),
            timeout: Duration::from_secs(2),
        };
        let summary = run(&options).await.unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 2);
    }

    #[test]
    fn synthetic_payloads_are_distinct() {
        let options = StressOptions {
            url: String::new(),
            requests: 2,
            interval: Duration::ZERO,
            payload: None,
            timeout: Duration::from_secs(1),
        };
        assert_ne!(payload_for(&options, 0), payload_for(&options, 1));
    }
}
