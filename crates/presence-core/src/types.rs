use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Guard added to norms before dividing.
pub const NORM_EPSILON: f32 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    Empty,
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Face embedding vector (model-defined length, e.g. 512 for ArcFace).
///
/// Values coming out of the signal extractor or the store are expected to be
/// L2-normalized; [`Embedding::normalized`] restores the invariant after any
/// arithmetic (averaging) on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean length of the vector.
    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Return a unit-length copy. The zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: normalize(&self.values),
            model_version: self.model_version.clone(),
        }
    }

    /// Reject empty vectors and NaN/Inf components.
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(i) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite(i));
        }
        Ok(())
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        cosine_similarity(&self.values, &other.values)
    }
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Divide by `‖x‖₂ + ε`.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    let denom = l2_norm(values) + NORM_EPSILON;
    values.iter().map(|v| v / denom).collect()
}

/// `dot(a, b) / (‖a‖·‖b‖ + ε)`.
///
/// Always processes all dimensions; a zero vector yields 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    Ok(dot / (norm_a.sqrt() * norm_b.sqrt() + NORM_EPSILON))
}

/// An enrolled identity: one aggregated template per unique name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub template: Embedding,
    pub created_at: String,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate, even when below threshold.
    pub similarity: f32,
    /// Name of the matched identity (if any).
    pub identity: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            identity: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled identities.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError>;
}

/// Cosine similarity matcher with constant-time gallery traversal.
///
/// Always iterates ALL gallery entries. On equal similarity the earlier
/// entry wins, so callers that need a stable winner should sort the gallery
/// by name first.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, EmbeddingError> {
        probe.validate()?;

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let sim = probe.similarity(&identity.template)?;
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        let result = match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity: Some(gallery[idx].name.clone()),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        };

        tracing::trace!(
            gallery = gallery.len(),
            matched = result.matched,
            similarity = result.similarity,
            "compared probe against gallery"
        );

        Ok(result)
    }
}
