//! Frame signal sources.
//!
//! The capture pipeline (camera, detector, landmark model, embedding model)
//! lives outside this workspace. [`ReplaySource`] reads its output from a
//! JSON-lines recording, one frame per line:
//!
//! ```json
//! {"timestamp_ms": 33, "faces": [{"bbox": {"x": 10, "y": 12, "width": 80, "height": 96}, "embedding": [0.1, 0.2]}], "landmarks": [[0.41, 0.37], [0.44, 0.38]]}
//! ```
//!
//! `faces` and `landmarks` may be omitted or empty/null for frames without a
//! face.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use presence_core::{Embedding, LandmarkError, LandmarkScheme, LandmarkSet, Point};
use serde::Deserialize;
use thiserror::Error;

use crate::frame::{select_largest_face, BoundingBox, DetectedFace, FrameSignals};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read frame source: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("bad landmarks on line {line}: {source}")]
    Landmarks {
        line: usize,
        #[source]
        source: LandmarkError,
    },
}

/// Anything that yields per-frame signals in capture order.
pub trait SignalSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<FrameSignals>, SourceError>;
}

#[derive(Deserialize)]
struct RawFace {
    bbox: BoundingBox,
    embedding: Vec<f32>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Deserialize)]
struct RawFrame {
    timestamp_ms: u64,
    #[serde(default)]
    faces: Vec<RawFace>,
    #[serde(default)]
    landmarks: Option<Vec<[f32; 2]>>,
}

/// JSON-lines recording of extracted signals.
pub struct ReplaySource<R> {
    reader: R,
    scheme: LandmarkScheme,
    line: usize,
    sequence: u32,
}

impl ReplaySource<Box<dyn BufRead + Send>> {
    /// Open a recording file, or stdin when `path` is `-`.
    pub fn open(path: &Path, scheme: LandmarkScheme) -> Result<Self, SourceError> {
        let reader: Box<dyn BufRead + Send> = if path == Path::new("-") {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            Box::new(BufReader::new(File::open(path)?))
        };
        tracing::info!(path = %path.display(), "opened replay source");
        Ok(Self::from_reader(reader, scheme))
    }
}

impl<R: BufRead> ReplaySource<R> {
    pub fn from_reader(reader: R, scheme: LandmarkScheme) -> Self {
        Self {
            reader,
            scheme,
            line: 0,
            sequence: 0,
        }
    }

    fn parse(&mut self, text: &str) -> Result<FrameSignals, SourceError> {
        let line = self.line;
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| SourceError::Malformed {
            line,
            reason: e.to_string(),
        })?;

        let faces: Vec<DetectedFace> = raw
            .faces
            .into_iter()
            .map(|f| DetectedFace {
                bbox: f.bbox,
                embedding: Embedding {
                    values: f.embedding,
                    model_version: f.model_version,
                },
            })
            .collect();
        if faces.len() > 1 {
            tracing::debug!(line, faces = faces.len(), "multiple faces; keeping largest");
        }
        let face = select_largest_face(faces);

        let landmarks = match raw.landmarks {
            Some(points) if !points.is_empty() => {
                let points = points.into_iter().map(|[x, y]| Point::new(x, y)).collect();
                Some(
                    LandmarkSet::new(points, self.scheme)
                        .map_err(|source| SourceError::Landmarks { line, source })?,
                )
            }
            _ => None,
        };

        let frame = FrameSignals {
            timestamp: Duration::from_millis(raw.timestamp_ms),
            sequence: self.sequence,
            face,
            landmarks,
        };
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

impl<R: BufRead> SignalSource for ReplaySource<R> {
    fn next_frame(&mut self) -> Result<Option<FrameSignals>, SourceError> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let text = buf.trim();
            if text.is_empty() {
                continue;
            }
            return self.parse(text).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(text: &str) -> ReplaySource<Cursor<String>> {
        ReplaySource::from_reader(Cursor::new(text.to_string()), LandmarkScheme::FACE_MESH)
    }

    fn mesh_json() -> String {
        let points: Vec<String> = (0..468).map(|_| "[0.5,0.5]".to_string()).collect();
        format!("[{}]", points.join(","))
    }

    #[test]
    fn test_reads_frames_in_order() {
        let text = format!(
            "{{\"timestamp_ms\": 0}}\n\n{{\"timestamp_ms\": 33, \"faces\": [{{\"bbox\": {{\"x\": 0, \"y\": 0, \"width\": 10, \"height\": 10}}, \"embedding\": [1.0, 0.0]}}], \"landmarks\": {}}}\n",
            mesh_json()
        );
        let mut src = source(&text);

        let f0 = src.next_frame().unwrap().unwrap();
        assert_eq!(f0.sequence, 0);
        assert!(f0.face.is_none());
        assert!(f0.landmarks.is_none());

        let f1 = src.next_frame().unwrap().unwrap();
        assert_eq!(f1.sequence, 1);
        assert_eq!(f1.timestamp, Duration::from_millis(33));
        assert_eq!(f1.embedding().unwrap().values, vec![1.0, 0.0]);
        assert_eq!(f1.landmarks.as_ref().unwrap().len(), 468);

        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_multi_face_keeps_largest() {
        let text = r#"{"timestamp_ms": 5, "faces": [
            {"bbox": {"x": 0, "y": 0, "width": 10, "height": 10}, "embedding": [1.0]},
            {"bbox": {"x": 50, "y": 0, "width": 30, "height": 30}, "embedding": [2.0]}
        ]}"#
        .replace('\n', " ");
        let mut src = source(&text);
        let frame = src.next_frame().unwrap().unwrap();
        assert_eq!(frame.embedding().unwrap().values, vec![2.0]);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let mut src = source("{\"timestamp_ms\": 0}\nnot json\n");
        assert!(src.next_frame().unwrap().is_some());
        match src.next_frame() {
            Err(SourceError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }

    #[test]
    fn test_short_landmarks_rejected() {
        let mut src = source("{\"timestamp_ms\": 0, \"landmarks\": [[0.1, 0.2]]}\n");
        assert!(matches!(
            src.next_frame(),
            Err(SourceError::Landmarks {
                line: 1,
                source: LandmarkError::TooFewPoints { .. }
            })
        ));
    }

    #[test]
    fn test_empty_landmarks_means_no_mesh() {
        let mut src = source("{\"timestamp_ms\": 0, \"landmarks\": []}\n");
        let frame = src.next_frame().unwrap().unwrap();
        assert!(frame.landmarks.is_none());
    }
}
