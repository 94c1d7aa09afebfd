//! Job and result records exchanged through the broker.
//!
//! Both records travel as MessagePack maps (`rmp_serde::to_vec_named`) so
//! optional fields can be added without breaking consumers that are still
//! running an older build.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CourierError;

/// Unique identifier of a submitted job (random 128-bit UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of submitted work waiting in the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Opaque payload handed to the processor untouched.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub enqueue_time: DateTime<Utc>,

    /// Point after which the submitting caller has stopped waiting.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            enqueue_time: Utc::now(),
            deadline: None,
        }
    }

    /// Create a job whose deadline is `timeout` after its enqueue time.
    pub fn with_timeout(payload: Vec<u8>, timeout: Duration) -> Self {
        let mut job = Self::new(payload);
        job.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| job.enqueue_time.checked_add_signed(d));
        job
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CourierError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// One labelled score produced by a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f64,
}

impl Prediction {
    pub fn new(label: impl Into<String>, probability: f64) -> Self {
        Self {
            label: label.into(),
            probability,
        }
    }
}

/// The output produced for a specific job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub predictions: Vec<Prediction>,
    pub produced_time: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job_id: JobId, predictions: Vec<Prediction>) -> Self {
        Self {
            job_id,
            predictions,
            produced_time: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CourierError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourierError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn job_id_parses_its_display_form() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn job_envelope_keeps_binary_payload() {
        let payload = vec![0u8, 255, 7, 42];
        let job = Job::with_timeout(payload.clone(), Duration::from_secs(30));
        let decoded = Job::from_bytes(&job.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.deadline, job.deadline);
    }

    #[test]
    fn deadline_follows_enqueue_time() {
        let job = Job::with_timeout(b"x".to_vec(), Duration::from_secs(5));
        let deadline = job.deadline.unwrap();
        assert_eq!(deadline - job.enqueue_time, chrono::Duration::seconds(5));

        assert!(!job.is_expired_at(job.enqueue_time));
        assert!(job.is_expired_at(deadline + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn job_without_deadline_never_expires() {
        let job = Job::new(b"x".to_vec());
        assert!(!job.is_expired_at(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn garbage_does_not_decode_as_job() {
        let err = Job::from_bytes(b"definitely not msgpack").unwrap_err();
        assert!(matches!(err, CourierError::Decode(_)));
    }

    #[test]
    fn result_preserves_prediction_order() {
        let id = JobId::new();
        let result = JobResult::new(
            id,
            vec![Prediction::new("tabby_cat", 0.91), Prediction::new("tiger_cat", 0.05)],
        );
        let decoded = JobResult::from_bytes(&result.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.job_id, id);
        assert_eq!(decoded.predictions[0].label, "tabby_cat");
        assert_eq!(decoded.predictions[1].label, "tiger_cat");
    }
}
