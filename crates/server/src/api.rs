use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use courier_broker::ActivityEntry;
use courier_core::{CourierError, Prediction};

use crate::state::AppState;

// ── Home ──────────────────────────────────────────────────────────

pub const WELCOME: &str = "Welcome to the Courier prediction API!";

pub async fn home(State(state): State<Arc<AppState>>) -> &'static str {
    state.activity.record("Homepage accessed").await;
    WELCOME
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub broker: String,
    pub queue_depth: Option<u64>,
}

/// 200 with the current queue depth, or 503 when the broker is unreachable.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let broker = state.gateway.broker().name().to_string();
    let version = env!("CARGO_PKG_VERSION").to_string();
    match state.gateway.queue_depth().await {
        Ok(depth) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                version,
                broker,
                queue_depth: Some(depth),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "health check could not reach broker");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".into(),
                    version,
                    broker,
                    queue_depth: None,
                }),
            )
        }
    }
}

// ── Predict ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PredictParams {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Vec<Prediction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictResponse {
    fn ok(predictions: Vec<Prediction>) -> Self {
        Self {
            success: true,
            predictions: Some(predictions),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            predictions: None,
            error: Some(error.into()),
        }
    }
}

/// Submit the raw request body as a job and wait for its predictions.
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PredictParams>,
    body: Bytes,
) -> (StatusCode, Json<PredictResponse>) {
    if body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(PredictResponse::failed("No payload provided")),
        );
    }

    let max_secs = state.gateway.settings().max_timeout.as_secs();
    let timeout = match params.timeout_secs {
        Some(0) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(PredictResponse::failed("timeout_secs must be > 0")),
            )
        }
        Some(secs) if secs > max_secs => {
            return (
                StatusCode::BAD_REQUEST,
                Json(PredictResponse::failed(format!("timeout_secs must be <= {max_secs}"))),
            )
        }
        Some(secs) => Duration::from_secs(secs),
        None => state.gateway.settings().default_timeout,
    };

    match state.gateway.submit(body.to_vec(), timeout).await {
        Ok(result) => (StatusCode::OK, Json(PredictResponse::ok(result.predictions))),
        Err(e) => {
            let status = status_for(&e);
            let message = match e {
                CourierError::Timeout(_) => "Request timeout".to_string(),
                other => other.to_string(),
            };
            (status, Json(PredictResponse::failed(message)))
        }
    }
}

fn status_for(error: &CourierError) -> StatusCode {
    match error {
        CourierError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CourierError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CourierError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Logs ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogsParams {
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

const DEFAULT_LOG_COUNT: usize = 10;

/// Most recent activity entries, newest first.
pub async fn logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<ActivityEntry>>, (StatusCode, Json<ErrorResponse>)> {
    let count = params.count.unwrap_or(DEFAULT_LOG_COUNT);
    state.activity.recent(count).await.map(Json).map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })
}
