//! Facial landmark sets and the two scalar features derived from them.
//!
//! The core never looks at raw landmark indices directly. Every anatomical
//! point it needs is named by an [`Anchor`], and a [`LandmarkScheme`] maps
//! anchors to positions in whatever landmark model produced the set. Swapping
//! landmark models means supplying a different scheme, nothing else.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Guard added to the horizontal eyelid distance in the EAR denominator.
const EAR_EPSILON: f32 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LandmarkError {
    #[error("landmark set has {actual} points, scheme needs at least {required}")]
    TooFewPoints { required: usize, actual: usize },
    #[error("landmark {0} has a non-finite coordinate")]
    NonFinite(usize),
}

/// A 2D landmark position (normalized image coordinates or pixels, consistently).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Anatomical points used by the liveness features.
///
/// Each eye is described by six points in EAR order: one corner, two upper
/// lid points, the opposite corner, then the two lower lid points mirrored
/// (`LowerB` sits under `UpperB`, `LowerA` under `UpperA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    LeftEyeCornerA,
    LeftEyeUpperA,
    LeftEyeUpperB,
    LeftEyeCornerB,
    LeftEyeLowerB,
    LeftEyeLowerA,
    RightEyeCornerA,
    RightEyeUpperA,
    RightEyeUpperB,
    RightEyeCornerB,
    RightEyeLowerB,
    RightEyeLowerA,
    NoseTip,
    LeftCheek,
    RightCheek,
}

impl Anchor {
    pub const COUNT: usize = 15;

    pub const LEFT_EYE: [Anchor; 6] = [
        Anchor::LeftEyeCornerA,
        Anchor::LeftEyeUpperA,
        Anchor::LeftEyeUpperB,
        Anchor::LeftEyeCornerB,
        Anchor::LeftEyeLowerB,
        Anchor::LeftEyeLowerA,
    ];

    pub const RIGHT_EYE: [Anchor; 6] = [
        Anchor::RightEyeCornerA,
        Anchor::RightEyeUpperA,
        Anchor::RightEyeUpperB,
        Anchor::RightEyeCornerB,
        Anchor::RightEyeLowerB,
        Anchor::RightEyeLowerA,
    ];
}

/// Which eye to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    fn anchors(self) -> [Anchor; 6] {
        match self {
            Eye::Left => Anchor::LEFT_EYE,
            Eye::Right => Anchor::RIGHT_EYE,
        }
    }
}

/// Anchor → landmark index table for one landmark model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandmarkScheme {
    /// Indexed by `Anchor as usize`.
    indices: [usize; Anchor::COUNT],
}

impl LandmarkScheme {
    /// 468/478-point face mesh topology.
    pub const FACE_MESH: LandmarkScheme = LandmarkScheme {
        indices: [
            33, 160, 158, 133, 153, 144, // left eye
            362, 385, 387, 263, 373, 380, // right eye
            1,   // nose tip
            234, // left cheek
            454, // right cheek
        ],
    };

    pub const fn new(indices: [usize; Anchor::COUNT]) -> Self {
        Self { indices }
    }

    pub fn index(&self, anchor: Anchor) -> usize {
        self.indices[anchor as usize]
    }

    /// Smallest landmark count that covers every anchor.
    pub fn required_len(&self) -> usize {
        self.indices.iter().copied().max().map_or(0, |m| m + 1)
    }
}

impl Default for LandmarkScheme {
    fn default() -> Self {
        Self::FACE_MESH
    }
}

/// One frame's landmarks, validated against a scheme.
///
/// Construction guarantees every anchor resolves to a finite point, so the
/// feature accessors below cannot fail.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Vec<Point>,
    scheme: LandmarkScheme,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>, scheme: LandmarkScheme) -> Result<Self, LandmarkError> {
        let required = scheme.required_len();
        if points.len() < required {
            return Err(LandmarkError::TooFewPoints {
                required,
                actual: points.len(),
            });
        }
        for anchor_idx in scheme.indices {
            let p = points[anchor_idx];
            if !p.x.is_finite() || !p.y.is_finite() {
                return Err(LandmarkError::NonFinite(anchor_idx));
            }
        }
        Ok(Self { points, scheme })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, anchor: Anchor) -> Point {
        self.points[self.scheme.index(anchor)]
    }

    /// Eye aspect ratio: mean of the two vertical lid distances over the
    /// horizontal corner distance. Low values mean a closed eye.
    pub fn eye_aspect_ratio(&self, eye: Eye) -> f32 {
        let p = eye.anchors().map(|a| self.point(a));
        let v1 = p[1].distance(&p[5]);
        let v2 = p[2].distance(&p[4]);
        let h = p[0].distance(&p[3]);
        (v1 + v2) / (2.0 * h + EAR_EPSILON)
    }

    /// EAR averaged over both eyes.
    pub fn mean_eye_aspect_ratio(&self) -> f32 {
        (self.eye_aspect_ratio(Eye::Left) + self.eye_aspect_ratio(Eye::Right)) / 2.0
    }

    /// Rough yaw proxy: nose-tip x minus the cheek midpoint x.
    ///
    /// Positive when the head turns toward the camera's left (subject's right).
    pub fn approx_yaw(&self) -> f32 {
        let nose = self.point(Anchor::NoseTip);
        let left = self.point(Anchor::LeftCheek);
        let right = self.point(Anchor::RightCheek);
        nose.x - (left.x + right.x) / 2.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_mesh_required_len() {
        assert_eq!(LandmarkScheme::FACE_MESH.required_len(), 455);
        assert_eq!(LandmarkScheme::FACE_MESH.index(Anchor::NoseTip), 1);
        assert_eq!(LandmarkScheme::FACE_MESH.index(Anchor::RightEyeCornerB), 263);
    }

    #[test]
    fn test_too_few_points_rejected() {
        let err = LandmarkSet::new(vec![Point::new(0.0, 0.0); 100], LandmarkScheme::FACE_MESH)
            .unwrap_err();
        assert_eq!(
            err,
            LandmarkError::TooFewPoints {
                required: 455,
                actual: 100
            }
        );
    }

    #[test]
    fn test_non_finite_anchor_rejected() {
        let mut points = vec![Point::new(0.5, 0.5); 468];
        points[234] = Point::new(f32::NAN, 0.5);
        let err = LandmarkSet::new(points, LandmarkScheme::FACE_MESH).unwrap_err();
        assert_eq!(err, LandmarkError::NonFinite(234));
    }

    #[test]
    fn test_ear_matches_fixture() {
        for ear in [0.10, 0.15, 0.25, 0.30] {
            let set = fixtures::face(ear, 0.0);
            assert!((set.eye_aspect_ratio(Eye::Left) - ear).abs() < 1e-4);
            assert!((set.eye_aspect_ratio(Eye::Right) - ear).abs() < 1e-4);
            assert!((set.mean_eye_aspect_ratio() - ear).abs() < 1e-4);
        }
    }

    #[test]
    fn test_ear_degenerate_eye_is_finite() {
        // All six eye points coincide: horizontal distance is zero.
        let points = vec![Point::new(0.5, 0.5); 468];
        let set = LandmarkSet::new(points, LandmarkScheme::FACE_MESH).unwrap();
        let ear = set.eye_aspect_ratio(Eye::Left);
        assert!(ear.is_finite());
        assert_eq!(ear, 0.0);
    }

    #[test]
    fn test_yaw_sign() {
        assert!(fixtures::face(0.3, 0.05).approx_yaw() > 0.04);
        assert!(fixtures::face(0.3, -0.05).approx_yaw() < -0.04);
        assert!(fixtures::face(0.3, 0.0).approx_yaw().abs() < 1e-6);
    }

    #[test]
    fn test_custom_scheme() {
        // Compact 15-point model: anchors in declaration order.
        let scheme = LandmarkScheme::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
        let mut points = vec![Point::new(0.0, 0.0); 15];
        points[12] = Point::new(0.6, 0.5);
        points[13] = Point::new(0.2, 0.5);
        points[14] = Point::new(0.8, 0.5);
        let set = LandmarkSet::new(points, scheme).unwrap();
        assert!((set.approx_yaw() - 0.1).abs() < 1e-6);
    }
}
