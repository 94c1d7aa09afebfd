//! Operator subcommands: broker connection check and activity log viewer.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use courier_broker::{ActivityEntry, ActivityLog, Broker, RedisBroker};
use courier_core::Config;

const PROBE_KEY: &str = "courier:probe";
const PROBE_VALUE: &[u8] = b"test_value";

/// PING the broker, then round-trip a probe key through set/get/delete.
pub async fn ping(config: &Config) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&config.redis)
        .await
        .with_context(|| format!("connecting to {}", config.redis.redacted_url()))?;
    check_broker(&broker).await?;
    println!("Redis connection successful!");
    println!("Test value retrieved: {}", String::from_utf8_lossy(PROBE_VALUE));
    Ok(())
}

pub async fn check_broker(broker: &dyn Broker) -> anyhow::Result<()> {
    broker.ping().await.context("PING failed")?;
    broker.set(PROBE_KEY, PROBE_VALUE.to_vec(), None).await?;
    let value = broker.get(PROBE_KEY).await?;
    broker.delete(PROBE_KEY).await?;

    match value.as_deref() {
        Some(v) if v == PROBE_VALUE => {
            info!(broker = %broker.name(), "probe key round-trip ok");
            Ok(())
        }
        other => anyhow::bail!("probe key read back {:?}", other.map(String::from_utf8_lossy)),
    }
}

/// Print the `count` most recent activity entries, oldest first.
pub async fn print_logs(config: &Config, count: usize) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&config.redis).await?);
    let log = ActivityLog::new(broker, &config.log, "cli");
    let entries = log.recent(count).await?;

    println!("Recent Application Logs:");
    println!("{}", "=".repeat(50));
    if entries.is_empty() {
        println!("No logs found.");
        return Ok(());
    }
    for line in render_oldest_first(&entries) {
        println!("{line}");
    }
    Ok(())
}

fn render_oldest_first(entries: &[ActivityEntry]) -> Vec<String> {
    entries.iter().rev().map(ToString::to_string).collect()
}
