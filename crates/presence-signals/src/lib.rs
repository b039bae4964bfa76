//! presence-signals — Per-frame face signals and where they come from.
//!
//! Defines the data a face pipeline hands to the core each frame (bounding
//! box, embedding, landmark set) and a replay source that reads recorded
//! pipeline output.

pub mod frame;
pub mod source;

pub use frame::{select_largest_face, BoundingBox, DetectedFace, FrameSignals};
pub use source::{ReplaySource, SignalSource, SourceError};
