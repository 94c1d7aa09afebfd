use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the courier submission and worker paths.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no result within {0:?}")]
    Timeout(Duration),

    #[error("work queue full: {depth} pending jobs (limit {limit})")]
    QueueFull { depth: u64, limit: u64 },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl CourierError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
