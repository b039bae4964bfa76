//! Aggregation of liveness-gated probe embeddings into one identity template.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::types::{Embedding, EmbeddingError};

/// Absolute minimum number of samples for any template.
pub const MIN_SAMPLES_FLOOR: usize = 8;

/// Default spacing between accepted samples, so near-duplicate consecutive
/// frames do not dominate the mean.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentError {
    #[error("insufficient samples: collected {collected}, need at least {required}")]
    InsufficientSamples { collected: usize, required: usize },
    #[error("invalid sample: {0}")]
    InvalidSample(#[from] EmbeddingError),
}

/// Samples a session must collect for a given target: `max(8, target / 2)`.
pub fn minimum_samples(target: usize) -> usize {
    MIN_SAMPLES_FLOOR.max(target / 2)
}

/// Collects unit embeddings for one enrollment session.
#[derive(Debug, Clone)]
pub struct EnrollmentAggregator {
    samples: Vec<Embedding>,
    min_interval: Duration,
    last_accepted: Option<Instant>,
}

impl Default for EnrollmentAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl EnrollmentAggregator {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            samples: Vec::new(),
            min_interval,
            last_accepted: None,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample unconditionally.
    ///
    /// The sample is re-normalized and must match the dimension of the
    /// samples already collected.
    pub fn add(&mut self, embedding: &Embedding) -> Result<(), EmbeddingError> {
        embedding.validate()?;
        if let Some(first) = self.samples.first() {
            if first.dim() != embedding.dim() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: first.dim(),
                    actual: embedding.dim(),
                });
            }
        }
        self.samples.push(embedding.normalized());
        Ok(())
    }

    /// Append a sample captured at `now` unless it arrives within the
    /// minimum interval of the previous accepted one. Returns whether it
    /// was taken.
    pub fn offer(&mut self, embedding: &Embedding, now: Instant) -> Result<bool, EmbeddingError> {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.min_interval {
                return Ok(false);
            }
        }
        self.add(embedding)?;
        self.last_accepted = Some(now);
        Ok(true)
    }

    /// Mean of all samples, re-normalized to unit length.
    ///
    /// Fails without producing anything if fewer than `min_required`
    /// samples were collected.
    pub fn finalize(&self, min_required: usize) -> Result<Embedding, EnrollmentError> {
        let required = min_required.max(1);
        if self.samples.len() < required {
            return Err(EnrollmentError::InsufficientSamples {
                collected: self.samples.len(),
                required,
            });
        }

        let dim = self.samples[0].dim();
        let mut sum = vec![0.0f32; dim];
        for sample in &self.samples {
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }
        let n = self.samples.len() as f32;
        let mean = Embedding {
            values: sum.into_iter().map(|v| v / n).collect(),
            model_version: self.samples[0].model_version.clone(),
        };

        let template = mean.normalized();
        tracing::debug!(
            samples = self.samples.len(),
            dim,
            mean_norm = mean.norm(),
            "enrollment template aggregated"
        );
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit vector near a fixed centroid, perturbed by `i`.
    fn sample(i: usize) -> Embedding {
        let mut values = vec![0.5f32, 0.5, 0.5, 0.5];
        values[i % 4] += 0.01 * (i as f32 + 1.0);
        Embedding::new(values).normalized()
    }

    #[test]
    fn test_minimum_samples() {
        assert_eq!(minimum_samples(20), 10);
        assert_eq!(minimum_samples(10), 8);
        assert_eq!(minimum_samples(0), 8);
        assert_eq!(minimum_samples(40), 20);
    }

    #[test]
    fn test_finalize_insufficient() {
        let mut agg = EnrollmentAggregator::default();
        for i in 0..5 {
            agg.add(&sample(i)).unwrap();
        }
        let err = agg.finalize(minimum_samples(20)).unwrap_err();
        assert_eq!(
            err,
            EnrollmentError::InsufficientSamples {
                collected: 5,
                required: 10
            }
        );
    }

    #[test]
    fn test_finalize_unit_norm() {
        let mut agg = EnrollmentAggregator::default();
        for i in 0..12 {
            agg.add(&sample(i)).unwrap();
        }
        let template = agg.finalize(minimum_samples(20)).unwrap();
        assert!((template.norm() - 1.0).abs() < 1e-6);
        // The mean stays close to every sample.
        for i in 0..12 {
            assert!(template.similarity(&sample(i)).unwrap() > 0.99);
        }
    }

    #[test]
    fn test_finalize_renormalizes_mean() {
        // Two orthogonal unit vectors average to norm ~0.707.
        let mut agg = EnrollmentAggregator::default();
        agg.add(&Embedding::new(vec![1.0, 0.0])).unwrap();
        agg.add(&Embedding::new(vec![0.0, 1.0])).unwrap();
        let template = agg.finalize(2).unwrap();
        assert!((template.norm() - 1.0).abs() < 1e-6);
        assert!((template.values[0] - template.values[1]).abs() < 1e-6);
    }

    #[test]
    fn test_add_normalizes_input() {
        let mut agg = EnrollmentAggregator::default();
        agg.add(&Embedding::new(vec![3.0, 4.0])).unwrap();
        let template = agg.finalize(1).unwrap();
        assert!((template.values[0] - 0.6).abs() < 1e-6);
        assert!((template.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_add_rejects_dimension_change() {
        let mut agg = EnrollmentAggregator::default();
        agg.add(&Embedding::new(vec![1.0, 0.0])).unwrap();
        let err = agg.add(&Embedding::new(vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, EmbeddingError::DimensionMismatch { .. }));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_offer_enforces_spacing() {
        let t0 = Instant::now();
        let mut agg = EnrollmentAggregator::default();
        assert!(agg.offer(&sample(0), t0).unwrap());
        assert!(!agg.offer(&sample(1), t0 + Duration::from_millis(100)).unwrap());
        assert!(agg.offer(&sample(2), t0 + Duration::from_millis(150)).unwrap());
        assert!(!agg.offer(&sample(3), t0 + Duration::from_millis(299)).unwrap());
        assert!(agg.offer(&sample(4), t0 + Duration::from_millis(300)).unwrap());
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn test_offer_rejected_sample_does_not_move_clock() {
        let t0 = Instant::now();
        let mut agg = EnrollmentAggregator::default();
        assert!(agg.offer(&sample(0), t0).unwrap());
        assert!(agg
            .offer(&Embedding::new(vec![f32::NAN; 4]), t0 + Duration::from_millis(200))
            .is_err());
        assert!(agg.offer(&sample(1), t0 + Duration::from_millis(200)).unwrap());
    }
}
