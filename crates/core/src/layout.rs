use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Names of the broker structures shared by gateways and the worker.
///
/// Every gateway instance and the worker must agree on this layout; a
/// mismatched `channel_prefix` means results are published where nobody is
/// listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLayout {
    /// The single list holding pending jobs.
    pub queue_name: String,

    /// Prefix of the per-job notification channel.
    pub channel_prefix: String,

    /// Prefix of the per-job durable result key. Empty means the bare job id.
    pub result_key_prefix: String,

    /// List receiving records of jobs that exhausted their attempts.
    pub dead_letter_queue: Option<String>,
}

pub const DEFAULT_QUEUE_NAME: &str = "job_queue";
pub const DEFAULT_CHANNEL_PREFIX: &str = "result__";

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.into(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.into(),
            result_key_prefix: String::new(),
            dead_letter_queue: None,
        }
    }
}

impl KeyLayout {
    pub fn result_channel(&self, job_id: &JobId) -> String {
        format!("{}{}", self.channel_prefix, job_id)
    }

    pub fn result_key(&self, job_id: &JobId) -> String {
        format!("{}{}", self.result_key_prefix, job_id)
    }
}
