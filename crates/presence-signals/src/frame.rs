//! Per-frame signal types produced by the face pipeline.

use std::time::Duration;

use presence_core::{Embedding, LandmarkSet};
use serde::{Deserialize, Serialize};

/// Face bounding box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Box area; degenerate (negative) extents count as zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// A detected face and its unit-normalized embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Everything the core needs from one captured frame.
#[derive(Debug, Clone)]
pub struct FrameSignals {
    /// Offset from the start of the capture.
    pub timestamp: Duration,
    pub sequence: u32,
    pub face: Option<DetectedFace>,
    pub landmarks: Option<LandmarkSet>,
}

impl FrameSignals {
    pub fn embedding(&self) -> Option<&Embedding> {
        self.face.as_ref().map(|f| &f.embedding)
    }
}

/// Reduce a multi-face detection to the single subject the core works on.
///
/// Policy: the largest bounding box wins; on equal area the face listed
/// first is kept, so the choice is deterministic for a given detector output.
pub fn select_largest_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    let mut best: Option<DetectedFace> = None;
    for face in faces {
        let is_better = match &best {
            None => true,
            Some(prev) => face.bbox.area() > prev.bbox.area(),
        };
        if is_better {
            best = Some(face);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(label: f32, width: f32, height: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width,
                height,
            },
            embedding: Embedding::new(vec![label]),
        }
    }

    #[test]
    fn test_largest_face_wins() {
        let faces = vec![face(1.0, 10.0, 10.0), face(2.0, 40.0, 30.0), face(3.0, 20.0, 20.0)];
        let chosen = select_largest_face(faces).unwrap();
        assert_eq!(chosen.embedding.values, vec![2.0]);
    }

    #[test]
    fn test_equal_area_first_wins() {
        let faces = vec![face(1.0, 20.0, 10.0), face(2.0, 10.0, 20.0)];
        let chosen = select_largest_face(faces).unwrap();
        assert_eq!(chosen.embedding.values, vec![1.0]);
    }

    #[test]
    fn test_no_faces() {
        assert!(select_largest_face(Vec::new()).is_none());
    }

    #[test]
    fn test_degenerate_box_area() {
        let b = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: -5.0,
            height: 10.0,
        };
        assert_eq!(b.area(), 0.0);
    }
}
