//! presence-core — Liveness and attendance decision engine.
//!
//! Operates on signals a face pipeline has already extracted: landmark sets
//! for the challenge-response liveness check, unit embeddings for matching
//! and enrollment. No pixels, no I/O.

pub mod enrollment;
pub mod landmarks;
pub mod ledger;
pub mod liveness;
pub mod types;

pub use enrollment::{minimum_samples, EnrollmentAggregator, EnrollmentError};
pub use landmarks::{Anchor, LandmarkError, LandmarkScheme, LandmarkSet, Point};
pub use ledger::{AttendanceEvent, AttendanceLedger, DayRecord, Punch};
pub use liveness::{Challenge, LivenessConfig, LivenessSession, LivenessVerdict};
pub use types::{CosineMatcher, Embedding, EmbeddingError, Identity, MatchResult, Matcher};
