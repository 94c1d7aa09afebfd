//! Broker-backed activity log shared by every process of a deployment.
//!
//! Entries are JSON objects prepended to a capped list, so any process (or
//! the `logs` subcommand) can read what the others did recently.

use std::sync::Arc;

use chrono::{Local, Utc};
use courier_core::config::LogConfig;
use courier_core::CourierError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::traits::Broker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub server_name: String,
    pub script_name: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Local time, `%Y-%m-%d %H:%M:%S`.
    pub timestamp_formatted: String,
    pub action: String,
}

impl ActivityEntry {
    pub fn new(server_name: impl Into<String>, script_name: impl Into<String>, action: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            server_name: server_name.into(),
            script_name: script_name.into(),
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            timestamp_formatted: now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
            action: action.into(),
        }
    }
}

impl std::fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.timestamp_formatted, self.server_name, self.script_name, self.action
        )
    }
}

/// Basename of the running executable, or `"courier"` when unknown.
fn current_script_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg0| {
            std::path::Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "courier".to_string())
}

/// Writer and reader for one activity list.
#[derive(Clone)]
pub struct ActivityLog {
    broker: Arc<dyn Broker>,
    list: String,
    max_entries: usize,
    server_name: String,
    script_name: String,
}

impl ActivityLog {
    pub fn new(broker: Arc<dyn Broker>, config: &LogConfig, server_name: impl Into<String>) -> Self {
        Self {
            broker,
            list: config.list.clone(),
            max_entries: config.max_entries.max(1),
            server_name: server_name.into(),
            script_name: current_script_name(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Record an action. Failures to reach the broker are logged and
    /// swallowed; the activity log never fails the operation it describes.
    pub async fn record(&self, action: impl Into<String>) {
        let entry = ActivityEntry::new(&self.server_name, &self.script_name, action);
        info!(server = %entry.server_name, script = %entry.script_name, "{}", entry.action);

        let encoded = match serde_json::to_vec(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "failed to encode activity entry");
                return;
            }
        };
        if let Err(e) = self
            .broker
            .prepend_capped(&self.list, encoded, self.max_entries)
            .await
        {
            warn!(error = %e, list = %self.list, "failed to record activity");
        }
    }

    /// The `count` most recent entries, newest first. Entries that are not
    /// valid JSON are skipped.
    pub async fn recent(&self, count: usize) -> Result<Vec<ActivityEntry>, CourierError> {
        let raw = self.broker.head(&self.list, count).await?;
        Ok(raw
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping malformed activity entry");
                    None
                }
            })
            .collect())
    }
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog")
            .field("broker", &self.broker.name())
            .field("list", &self.list)
            .field("max_entries", &self.max_entries)
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::traits::CappedList;

    fn log_config(max_entries: usize) -> LogConfig {
        LogConfig {
            list: "test_logs".into(),
            max_entries,
        }
    }

    #[tokio::test]
    async fn record_then_read_newest_first() {
        let broker = Arc::new(MemoryBroker::new());
        let log = ActivityLog::new(broker, &log_config(10), "web_server");

        log.record("first").await;
        log.record("second").await;

        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "second");
        assert_eq!(entries[1].action, "first");
        assert_eq!(entries[0].server_name, "web_server");
        assert!(!entries[0].script_name.is_empty());
    }

    #[tokio::test]
    async fn list_is_capped() {
        let broker = Arc::new(MemoryBroker::new());
        let log = ActivityLog::new(broker, &log_config(3), "model_server");

        for i in 0..5 {
            log.record(format!("action {i}")).await;
        }

        let entries = log.recent(10).await.unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["action 4", "action 3", "action 2"]);
    }

    #[tokio::test]
    async fn record_survives_disconnect() {
        let broker = Arc::new(MemoryBroker::new());
        let log = ActivityLog::new(broker.clone(), &log_config(10), "web_server");

        broker.disconnect().await;
        log.record("lost").await;
        assert!(log.recent(10).await.is_err());

        broker.reconnect();
        assert!(log.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .prepend_capped("test_logs", b"not json".to_vec(), 10)
            .await
            .unwrap();
        let log = ActivityLog::new(broker, &log_config(10), "web_server");
        log.record("ok").await;

        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "ok");
    }

    #[test]
    fn display_matches_log_line_format() {
        let entry = ActivityEntry {
            server_name: "web_server".into(),
            script_name: "courier-server".into(),
            timestamp: 0.0,
            timestamp_formatted: "2024-01-01 12:00:00".into(),
            action: "Server started".into(),
        };
        assert_eq!(
            entry.to_string(),
            "[2024-01-01 12:00:00] web_server (courier-server): Server started"
        );
    }
}
