//! Job submission gateway: the producer half of the request/response protocol.
//!
//! A submission subscribes to the job's result channel, enqueues the job and
//! then waits for the worker's notification or the caller's timeout,
//! whichever comes first. The subscription is always live before the job is
//! visible to any worker, so a fast worker can never publish into the void.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{ActivityLog, Broker, Subscription};
use courier_core::config::QueueConfig;
use courier_core::{CourierError, Job, JobId, JobResult, KeyLayout};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub layout: KeyLayout,
    /// Timeout used by [`Gateway::submit_default`].
    pub default_timeout: Duration,
    /// Longer waits passed to [`Gateway::submit`] are clamped to this.
    pub max_timeout: Duration,
    /// Reject submissions once the work queue holds this many jobs. 0 = unbounded.
    pub max_queue_depth: u64,
    /// Read the durable result slot once after a notification timeout.
    pub fallback_poll: bool,
}

impl From<&QueueConfig> for GatewaySettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            layout: config.layout.clone(),
            default_timeout: config.server_timeout,
            max_timeout: config.max_timeout,
            max_queue_depth: config.max_queue_depth,
            fallback_poll: config.fallback_poll,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// Cheap to clone; every clone shares the same broker handle.
#[derive(Clone)]
pub struct Gateway {
    broker: Arc<dyn Broker>,
    settings: Arc<GatewaySettings>,
    activity: Option<ActivityLog>,
}

impl Gateway {
    pub fn new(broker: Arc<dyn Broker>, settings: GatewaySettings) -> Self {
        Self {
            broker,
            settings: Arc::new(settings),
            activity: None,
        }
    }

    pub fn with_activity_log(mut self, log: ActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Number of jobs currently waiting in the work queue.
    pub async fn queue_depth(&self) -> Result<u64, CourierError> {
        self.broker.len(&self.settings.layout.queue_name).await
    }

    /// Submit with [`GatewaySettings::default_timeout`].
    pub async fn submit_default(&self, payload: Vec<u8>) -> Result<JobResult, CourierError> {
        self.submit(payload, self.settings.default_timeout).await
    }

    /// Submit `payload` and wait up to `timeout` for its result.
    ///
    /// `timeout` is clamped to [`GatewaySettings::max_timeout`]. The job's
    /// deadline and the wait both count from the start of the call.
    ///
    /// Returns [`CourierError::Timeout`] when no result arrived in time,
    /// [`CourierError::QueueFull`] when admission control rejected the job
    /// and [`CourierError::Transport`] when the broker failed. The job's
    /// subscription and durable result slot are released on every path,
    /// including when this future is dropped mid-wait.
    pub async fn submit(&self, payload: Vec<u8>, timeout: Duration) -> Result<JobResult, CourierError> {
        self.admit().await?;

        let timeout = self.clamp_timeout(timeout);
        let deadline = Instant::now().checked_add(timeout);
        let job = Job::with_timeout(payload, timeout);
        let job_id = job.id;
        let encoded = job.to_bytes()?;
        let layout = &self.settings.layout;

        let mut subscription = self.broker.subscribe(&layout.result_channel(&job_id)).await?;
        let slot = ResultSlot::new(self.broker.clone(), layout.result_key(&job_id));

        let depth = self.broker.push(&layout.queue_name, encoded).await?;
        debug!(job_id = %job_id, depth, "job enqueued");
        self.record(format!("Received job for prediction with ID: {job_id}")).await;

        let mut outcome = wait_for_result(&mut subscription, job_id, deadline, timeout).await;
        drop(subscription);

        if matches!(outcome, Err(CourierError::Timeout(_))) && self.settings.fallback_poll {
            if let Some(result) = self.poll_slot(slot.key(), job_id).await {
                info!(job_id = %job_id, "result recovered from durable slot after timeout");
                outcome = Ok(result);
            }
        }

        match &outcome {
            Ok(_) => self.record(format!("Received prediction result for ID: {job_id}")).await,
            Err(CourierError::Timeout(_)) => self.record(format!("Request timeout for ID: {job_id}")).await,
            Err(e) => self.record(format!("Error processing request for ID {job_id}: {e}")).await,
        }

        slot.release().await;
        outcome
    }

    fn clamp_timeout(&self, timeout: Duration) -> Duration {
        let max = self.settings.max_timeout;
        if timeout > max {
            warn!(requested = ?timeout, max = ?max, "submission timeout clamped");
            return max;
        }
        timeout
    }

    async fn admit(&self) -> Result<(), CourierError> {
        let limit = self.settings.max_queue_depth;
        if limit == 0 {
            return Ok(());
        }
        let depth = self.queue_depth().await?;
        if depth >= limit {
            warn!(depth, limit, "work queue full, rejecting submission");
            return Err(CourierError::QueueFull { depth, limit });
        }
        Ok(())
    }

    /// One read of the durable slot. Broker and decode errors count as "nothing there".
    async fn poll_slot(&self, key: &str, job_id: JobId) -> Option<JobResult> {
        let bytes = match self.broker.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "fallback poll failed");
                return None;
            }
        };
        match JobResult::from_bytes(&bytes) {
            Ok(result) if result.job_id == job_id => Some(result),
            Ok(result) => {
                warn!(job_id = %job_id, found = %result.job_id, "durable slot holds another job's result");
                None
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "undecodable result in durable slot");
                None
            }
        }
    }

    async fn record(&self, action: String) {
        if let Some(log) = &self.activity {
            log.record(action).await;
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("broker", &self.broker.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Wait on `subscription` until a result for `job_id` arrives or `deadline` passes.
///
/// A `None` deadline lies beyond what `Instant` can represent and never
/// fires. Undecodable messages and results for other jobs are skipped; the
/// wait continues against the original deadline.
async fn wait_for_result(
    subscription: &mut Subscription,
    job_id: JobId,
    deadline: Option<Instant>,
    timeout: Duration,
) -> Result<JobResult, CourierError> {
    loop {
        let received = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, subscription.recv()).await,
            None => Ok(subscription.recv().await),
        };
        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(CourierError::Transport(format!(
                    "subscription to {} closed",
                    subscription.channel()
                )))
            }
            Err(_) => return Err(CourierError::Timeout(timeout)),
        };

        match JobResult::from_bytes(&message) {
            Ok(result) if result.job_id == job_id => return Ok(result),
            Ok(result) => warn!(job_id = %job_id, foreign = %result.job_id, "ignoring result for another job"),
            Err(e) => warn!(job_id = %job_id, error = %e, "ignoring undecodable notification"),
        }
    }
}

/// Owns deletion of one job's durable result slot.
///
/// [`ResultSlot::release`] deletes inline. If the owning future is dropped
/// first, the delete is spawned onto the current runtime instead.
struct ResultSlot {
    broker: Arc<dyn Broker>,
    key: String,
    armed: bool,
}

impl ResultSlot {
    fn new(broker: Arc<dyn Broker>, key: String) -> Self {
        Self {
            broker,
            key,
            armed: true,
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    async fn release(mut self) {
        self.armed = false;
        delete_slot(self.broker.as_ref(), &self.key).await;
    }
}

impl Drop for ResultSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let broker = self.broker.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { delete_slot(broker.as_ref(), &key).await });
            }
            Err(_) => warn!(key = %key, "no runtime to clean up result slot"),
        }
    }
}

async fn delete_slot(broker: &dyn Broker, key: &str) {
    if let Err(e) = broker.delete(key).await {
        warn!(key = %key, error = %e, "failed to delete result slot");
    }
}
