//! The pluggable compute operation run by the worker on each job.

use async_trait::async_trait;
use courier_core::{CourierError, Prediction};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("processing failed: {0}")]
    Failed(String),
}

impl From<ProcessingError> for CourierError {
    fn from(e: ProcessingError) -> Self {
        CourierError::Processing(e.to_string())
    }
}

/// Turns a job payload into an ordered list of predictions.
///
/// Malformed input should be reported as [`ProcessingError::InvalidPayload`].
/// A panic is caught by the worker and counted as a failed attempt.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, payload: &[u8]) -> Result<Vec<Prediction>, ProcessingError>;

    fn name(&self) -> &str;
}

const DIGEST_LABELS: [&str; 10] = [
    "tabby_cat",
    "golden_retriever",
    "pembroke",
    "beagle",
    "persian_cat",
    "siamese_cat",
    "red_fox",
    "lynx",
    "tiger_cat",
    "egyptian_cat",
];

/// Deterministic stand-in model.
///
/// Scores every label from a SHA-256 digest of the payload and returns the
/// `top_k` highest, so equal payloads always get equal predictions and
/// different payloads almost always differ.
#[derive(Debug, Clone)]
pub struct DigestProcessor {
    top_k: usize,
}

impl DigestProcessor {
    pub const DEFAULT_TOP_K: usize = 5;

    pub fn new(top_k: usize) -> Self {
        Self {
            top_k: top_k.clamp(1, DIGEST_LABELS.len()),
        }
    }

    /// Synchronous core of [`Processor::process`].
    pub fn predict(&self, payload: &[u8]) -> Result<Vec<Prediction>, ProcessingError> {
        if payload.is_empty() {
            return Err(ProcessingError::InvalidPayload("empty payload".into()));
        }

        let digest = Sha256::digest(payload);
        let weights: Vec<u32> = digest
            .chunks_exact(2)
            .take(DIGEST_LABELS.len())
            .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])) + 1)
            .collect();
        let total: u32 = weights.iter().sum();

        let mut scored: Vec<Prediction> = DIGEST_LABELS
            .iter()
            .zip(&weights)
            .map(|(label, weight)| {
                let probability = f64::from(*weight) / f64::from(total);
                Prediction::new(*label, (probability * 10_000.0).round() / 10_000.0)
            })
            .collect();
        scored.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        scored.truncate(self.top_k);
        Ok(scored)
    }
}

impl Default for DigestProcessor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TOP_K)
    }
}

#[async_trait]
impl Processor for DigestProcessor {
    async fn process(&self, payload: &[u8]) -> Result<Vec<Prediction>, ProcessingError> {
        self.predict(payload)
    }

    fn name(&self) -> &str {
        "digest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_payload_same_predictions() {
        let p = DigestProcessor::default();
        assert_eq!(p.predict(b"cat.png").unwrap(), p.predict(b"cat.png").unwrap());
    }

    #[test]
    fn different_payloads_differ() {
        let p = DigestProcessor::default();
        assert_ne!(p.predict(b"cat.png").unwrap(), p.predict(b"dog.png").unwrap());
    }

    #[test]
    fn predictions_are_sorted_and_bounded() {
        let p = DigestProcessor::new(3);
        let preds = p.predict(b"jemma.png").unwrap();

        assert_eq!(preds.len(), 3);
        assert!(preds.windows(2).all(|w| w[0].probability >= w[1].probability));
        assert!(preds.iter().all(|p| (0.0..=1.0).contains(&p.probability)));
    }

    #[test]
    fn top_k_is_clamped() {
        assert_eq!(DigestProcessor::new(0).predict(b"x").unwrap().len(), 1);
        assert_eq!(DigestProcessor::new(100).predict(b"x").unwrap().len(), DIGEST_LABELS.len());
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let err = DigestProcessor::default().process(b"").await.unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidPayload(_)));

        let courier: CourierError = err.into();
        assert!(matches!(courier, CourierError::Processing(_)));
    }
}
