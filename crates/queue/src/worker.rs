//! The single consumer of the work queue.
//!
//! Each cycle is `dequeue (bounded wait) -> process -> publish`. Shutdown is
//! only observed between cycles, so a job that has been popped is always
//! carried through to publication or failure.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_broker::{ActivityLog, Broker};
use courier_core::config::QueueConfig;
use courier_core::{CourierError, Job, JobId, JobResult, KeyLayout, Prediction};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::processor::{ProcessingError, Processor};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub layout: KeyLayout,
    /// Upper bound on one blocking pop; also the shutdown check interval.
    pub dequeue_wait: Duration,
    /// Expiry of the durable result slot. `None` keeps it until deleted.
    pub result_ttl: Option<Duration>,
    /// Drop jobs whose submitter has already given up.
    pub skip_expired_jobs: bool,
    /// Processing attempts per job, including the first.
    pub max_attempts: u32,
    /// Pause after a broker error before the next dequeue.
    pub error_backoff: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            layout: config.layout.clone(),
            dequeue_wait: config.dequeue_wait,
            result_ttl: config.result_ttl,
            skip_expired_jobs: config.skip_expired_jobs,
            max_attempts: config.max_attempts.max(1),
            error_backoff: config.error_backoff,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// What a single [`WorkerLoop::run_once`] cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing arrived within the dequeue wait.
    Idle,
    /// The job was processed and its result stored and published.
    Completed(JobId),
    /// Every processing attempt failed; no result was produced.
    Failed(JobId),
    /// The queue entry was undecodable or its job had expired.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub transport_errors: u64,
}

/// Record pushed to the dead-letter list for a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub failed_time: DateTime<Utc>,
    pub attempts: u32,
}

impl DeadLetter {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CourierError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

pub struct WorkerLoop {
    broker: Arc<dyn Broker>,
    processor: Arc<dyn Processor>,
    settings: WorkerSettings,
    activity: Option<ActivityLog>,
    stats: WorkerStats,
}

impl WorkerLoop {
    pub fn new(broker: Arc<dyn Broker>, processor: Arc<dyn Processor>, settings: WorkerSettings) -> Self {
        Self {
            broker,
            processor,
            settings,
            activity: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn with_activity_log(mut self, log: ActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Run until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// Broker errors never end the loop; they are logged and followed by
    /// `error_backoff`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(
            processor = %self.processor.name(),
            queue = %self.settings.layout.queue_name,
            broker = %self.broker.name(),
            "worker started"
        );
        self.record(format!("Worker started with {} processor", self.processor.name()))
            .await;

        loop {
            let stopping = *shutdown.borrow();
            if stopping || shutdown.has_changed().is_err() {
                break;
            }
            if let Err(e) = self.run_once().await {
                self.stats.transport_errors += 1;
                warn!(error = %e, backoff = ?self.settings.error_backoff, "dequeue failed");
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        let stats = self.stats;
        info!(
            processed = stats.processed,
            failed = stats.failed,
            dropped = stats.dropped,
            transport_errors = stats.transport_errors,
            "worker stopped"
        );
        self.record("Worker stopped").await;
        stats
    }

    /// Perform exactly one dequeue cycle.
    ///
    /// Only a failed dequeue is returned as an error; processing and publish
    /// failures are handled inside the cycle.
    pub async fn run_once(&mut self) -> Result<CycleOutcome, CourierError> {
        let Some(entry) = self
            .broker
            .pop(&self.settings.layout.queue_name, self.settings.dequeue_wait)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        let job = match Job::from_bytes(&entry) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, bytes = entry.len(), "dropping undecodable queue entry");
                self.stats.dropped += 1;
                return Ok(CycleOutcome::Dropped);
            }
        };

        if self.settings.skip_expired_jobs && job.is_expired_at(Utc::now()) {
            info!(job_id = %job.id, deadline = ?job.deadline, "dropping expired job");
            self.stats.dropped += 1;
            return Ok(CycleOutcome::Dropped);
        }

        debug!(job_id = %job.id, bytes = job.payload.len(), "processing job");
        match self.process_with_retry(&job).await {
            Ok(predictions) => {
                self.publish(&JobResult::new(job.id, predictions)).await;
                self.stats.processed += 1;
                info!(job_id = %job.id, "job processed");
                self.record(format!("Processed job ID: {}", job.id)).await;
                Ok(CycleOutcome::Completed(job.id))
            }
            Err((e, attempts)) => {
                error!(job_id = %job.id, attempts, error = %e, "job failed");
                self.stats.failed += 1;
                self.record(format!("Error processing job ID {}: {e}", job.id)).await;
                let job_id = job.id;
                self.dead_letter(job, &e, attempts).await;
                Ok(CycleOutcome::Failed(job_id))
            }
        }
    }

    /// Returns the last error and the number of attempts made on failure.
    /// Invalid payloads are never retried.
    async fn process_with_retry(&self, job: &Job) -> Result<Vec<Prediction>, (ProcessingError, u32)> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.process_contained(job).await {
                Ok(predictions) => return Ok(predictions),
                Err(e @ ProcessingError::InvalidPayload(_)) => return Err((e, attempt)),
                Err(e) if attempt < max_attempts => {
                    warn!(job_id = %job.id, attempt, max_attempts, error = %e, "processing attempt failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// A panic inside the processor counts as a failed attempt.
    async fn process_contained(&self, job: &Job) -> Result<Vec<Prediction>, ProcessingError> {
        match AssertUnwindSafe(self.processor.process(&job.payload))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(job_id = %job.id, processor = %self.processor.name(), reason = %reason, "processor panicked");
                Err(ProcessingError::Failed(format!("processor panicked: {reason}")))
            }
        }
    }

    /// Store the result in its durable slot, then notify the waiting gateway.
    async fn publish(&self, result: &JobResult) {
        let layout = &self.settings.layout;
        let bytes = match result.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(job_id = %result.job_id, error = %e, "failed to encode result");
                return;
            }
        };

        let key = layout.result_key(&result.job_id);
        if let Err(e) = self.broker.set(&key, bytes.clone(), self.settings.result_ttl).await {
            warn!(job_id = %result.job_id, error = %e, "failed to store result");
        }

        match self.broker.publish(&layout.result_channel(&result.job_id), bytes).await {
            Ok(0) => debug!(job_id = %result.job_id, "result published with no subscriber"),
            Ok(receivers) => debug!(job_id = %result.job_id, receivers, "result published"),
            Err(e) => warn!(job_id = %result.job_id, error = %e, "failed to publish result"),
        }
    }

    async fn dead_letter(&self, job: Job, error: &ProcessingError, attempts: u32) {
        let Some(queue) = self.settings.layout.dead_letter_queue.as_deref() else {
            return;
        };
        let job_id = job.id;
        let letter = DeadLetter {
            job,
            error: error.to_string(),
            failed_time: Utc::now(),
            attempts,
        };
        let pushed = match letter.to_bytes() {
            Ok(bytes) => self.broker.push(queue, bytes).await,
            Err(e) => Err(e),
        };
        match pushed {
            Ok(_) => info!(job_id = %job_id, queue = %queue, "job dead-lettered"),
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to dead-letter job"),
        }
    }

    async fn record(&self, action: impl Into<String>) {
        if let Some(log) = &self.activity {
            log.record(action).await;
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::{KeyValueStore, MemoryBroker, WorkQueue};

    use crate::processor::DigestProcessor;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            dequeue_wait: Duration::from_millis(50),
            ..WorkerSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_when_queue_empty() {
        let broker = Arc::new(MemoryBroker::new());
        let mut worker = WorkerLoop::new(broker, Arc::new(DigestProcessor::default()), settings());

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);
        assert_eq!(worker.stats(), WorkerStats::default());
    }

    #[tokio::test]
    async fn undecodable_entry_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        broker.push("job_queue", b"garbage".to_vec()).await.unwrap();
        let mut worker = WorkerLoop::new(broker, Arc::new(DigestProcessor::default()), settings());

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Dropped);
        assert_eq!(worker.stats().dropped, 1);
    }

    #[tokio::test]
    async fn completed_job_writes_result_slot() {
        let broker = Arc::new(MemoryBroker::new());
        let job = Job::new(b"cat.png".to_vec());
        broker.push("job_queue", job.to_bytes().unwrap()).await.unwrap();
        let mut worker = WorkerLoop::new(broker.clone(), Arc::new(DigestProcessor::default()), settings());

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Completed(job.id));

        let stored = broker.get(&job.id.to_string()).await.unwrap().unwrap();
        let result = JobResult::from_bytes(&stored).unwrap();
        assert_eq!(result.job_id, job.id);
        assert_eq!(result.predictions, DigestProcessor::default().predict(b"cat.png").unwrap());
    }

    #[tokio::test]
    async fn invalid_payload_is_not_retried() {
        let broker = Arc::new(MemoryBroker::new());
        let job = Job::new(Vec::new());
        broker.push("job_queue", job.to_bytes().unwrap()).await.unwrap();
        let worker_settings = WorkerSettings {
            max_attempts: 3,
            ..settings()
        };
        let worker = WorkerLoop::new(broker, Arc::new(DigestProcessor::default()), worker_settings);

        let (err, attempts) = worker.process_with_retry(&job).await.unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidPayload(_)));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn panic_reason_reads_string_payloads() {
        assert_eq!(panic_reason(&"static message"), "static message");
        assert_eq!(panic_reason(&String::from("owned message")), "owned message");
        assert_eq!(panic_reason(&42u8), "unknown panic");
    }

    #[tokio::test]
    async fn dead_letter_record_decodes() {
        let letter = DeadLetter {
            job: Job::new(b"bad".to_vec()),
            error: "processing failed: boom".into(),
            failed_time: Utc::now(),
            attempts: 2,
        };
        let decoded = DeadLetter::from_bytes(&letter.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, letter);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_signal() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = WorkerLoop::new(broker, Arc::new(DigestProcessor::default()), settings());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.processed, 0);
    }
}
