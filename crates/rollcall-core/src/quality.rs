//! Enrollment quality gate.
//!
//! Capture is only allowed while exactly one face is visible and its box
//! covers a sensible share of the frame. The operator confirms capture;
//! nothing here commits on its own.

use crate::store::{StoreError, StudentDirectory};
use crate::student::{Student, StudentId, StudentPatch};
use crate::types::{Detection, Embedding};
use serde::Serialize;
use thiserror::Error;

/// Box-to-frame area ratio must be strictly above this.
pub const MIN_FACE_RATIO: f32 = 0.05;
/// Box-to-frame area ratio must be strictly below this.
pub const MAX_FACE_RATIO: f32 = 0.4;

/// Outcome of evaluating one frame for enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GateVerdict {
    NoFace,
    MultipleFaces { count: usize },
    TooSmall { ratio: f32 },
    TooLarge { ratio: f32 },
    Accepted { ratio: f32 },
}

impl GateVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateVerdict::Accepted { .. })
    }

    /// Operator guidance for this verdict.
    pub fn message(&self) -> String {
        match self {
            GateVerdict::NoFace => "no face detected".into(),
            GateVerdict::MultipleFaces { count } => {
                format!("multiple faces detected ({count}); only one person in frame")
            }
            GateVerdict::TooSmall { .. } => "face too small; move closer to the camera".into(),
            GateVerdict::TooLarge { .. } => "face too large; move back from the camera".into(),
            GateVerdict::Accepted { .. } => "face ready; capture enabled".into(),
        }
    }
}

/// Classify the detections of one frame.
pub fn evaluate(detections: &[Detection], frame_width: u32, frame_height: u32) -> GateVerdict {
    match detections {
        [] => GateVerdict::NoFace,
        [face] => {
            let ratio = face.bbox.area_ratio(frame_width, frame_height);
            if ratio <= MIN_FACE_RATIO {
                GateVerdict::TooSmall { ratio }
            } else if ratio >= MAX_FACE_RATIO {
                GateVerdict::TooLarge { ratio }
            } else {
                GateVerdict::Accepted { ratio }
            }
        }
        many => GateVerdict::MultipleFaces { count: many.len() },
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("no qualifying face to capture")]
    NotReady,
    #[error("student {0} is not in the directory")]
    UnknownStudent(StudentId),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Holds the latest accepted embedding for one enrollment.
#[derive(Debug, Default)]
pub struct RegistrationGate {
    latest: Option<Embedding>,
    verdict: Option<GateVerdict>,
}

impl RegistrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a frame. An accepted frame replaces the held embedding;
    /// anything else drops it.
    pub fn observe(
        &mut self,
        detections: &[Detection],
        frame_width: u32,
        frame_height: u32,
    ) -> GateVerdict {
        let verdict = evaluate(detections, frame_width, frame_height);
        self.latest = match (&verdict, detections) {
            (GateVerdict::Accepted { .. }, [face]) => Some(face.embedding.clone()),
            _ => None,
        };
        self.verdict = Some(verdict);
        verdict
    }

    pub fn capture_enabled(&self) -> bool {
        self.latest.is_some()
    }

    pub fn last_verdict(&self) -> Option<GateVerdict> {
        self.verdict
    }

    /// Take the held embedding and reset, so the next capture needs a fresh
    /// qualifying frame.
    pub fn take(&mut self) -> Result<Embedding, CaptureError> {
        self.verdict = None;
        self.latest.take().ok_or(CaptureError::NotReady)
    }

    pub fn reset(&mut self) {
        self.latest = None;
        self.verdict = None;
    }
}

/// Store a captured embedding as the student's face descriptor.
pub fn register_face<D: StudentDirectory + ?Sized>(
    directory: &mut D,
    student_id: StudentId,
    embedding: Embedding,
) -> Result<Student, CaptureError> {
    if directory.get_student(student_id)?.is_none() {
        return Err(CaptureError::UnknownStudent(student_id));
    }
    let student = directory.update_student(student_id, StudentPatch::register_face(embedding))?;
    tracing::info!(student_id, dims = ?student.face_descriptor.as_ref().map(|e| e.len()), "face registered");
    Ok(student)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::student::{NewStudent, StudentStatus};
    use crate::types::BoundingBox;

    const W: u32 = 100;
    const H: u32 = 100;

    /// A square face covering `ratio` of a 100x100 frame.
    fn face(ratio: f32, tag: f32) -> Detection {
        let side = (ratio * (W * H) as f32).sqrt();
        Detection {
            bbox: BoundingBox { x: 10.0, y: 10.0, width: side, height: side, confidence: 0.9 },
            embedding: Embedding::new(vec![tag; 4]),
        }
    }

    #[test]
    fn test_no_face() {
        assert_eq!(evaluate(&[], W, H), GateVerdict::NoFace);
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let v = evaluate(&[face(0.2, 1.0), face(0.2, 2.0)], W, H);
        assert_eq!(v, GateVerdict::MultipleFaces { count: 2 });
        assert!(!v.is_accepted());
    }

    #[test]
    fn test_ratio_bounds_are_exclusive() {
        // Exact boundary boxes: 5x10 and 40x100 in a 100x100 frame.
        let small = Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 5.0, height: 10.0, confidence: 0.9 },
            embedding: Embedding::new(vec![0.0; 4]),
        };
        let large = Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 40.0, height: 100.0, confidence: 0.9 },
            embedding: Embedding::new(vec![0.0; 4]),
        };
        assert!(matches!(evaluate(&[small], W, H), GateVerdict::TooSmall { .. }));
        assert!(matches!(evaluate(&[large], W, H), GateVerdict::TooLarge { .. }));
    }

    #[test]
    fn test_ratio_sweep() {
        // Step through 1%..59% coverage, staying clear of the exact bounds.
        for pct in 1..60 {
            if pct == 5 || pct == 40 {
                continue;
            }
            let ratio = pct as f32 / 100.0;
            let v = evaluate(&[face(ratio, 0.0)], W, H);
            assert_eq!(v.is_accepted(), pct > 5 && pct < 40, "ratio {ratio}: {v:?}");
        }
    }

    #[test]
    fn test_too_close_then_step_back_then_capture() {
        let mut store = MemoryStore::new();
        let student = store
            .insert_student(NewStudent {
                code: "S-1".into(),
                first_name: "Ada".into(),
                last_name: "L".into(),
                class_level: String::new(),
                room: String::new(),
                status: StudentStatus::Active,
            })
            .unwrap();

        let mut gate = RegistrationGate::new();
        let v = gate.observe(&[face(0.5, 1.0)], W, H);
        assert!(matches!(v, GateVerdict::TooLarge { .. }));
        assert_eq!(v.message(), "face too large; move back from the camera");
        assert!(!gate.capture_enabled());

        let v = gate.observe(&[face(0.2, 2.0)], W, H);
        assert!(v.is_accepted());
        assert!(gate.capture_enabled());

        let embedding = gate.take().unwrap();
        assert_eq!(embedding.values, vec![2.0; 4]);
        let updated = register_face(&mut store, student.id, embedding).unwrap();
        assert!(updated.face_registered());

        // Gate requires a fresh detection before the next capture.
        assert!(!gate.capture_enabled());
        assert_eq!(gate.take(), Err(CaptureError::NotReady));
    }

    #[test]
    fn test_rejected_frame_drops_held_embedding() {
        let mut gate = RegistrationGate::new();
        gate.observe(&[face(0.2, 1.0)], W, H);
        assert!(gate.capture_enabled());
        gate.observe(&[], W, H);
        assert!(!gate.capture_enabled());
        assert_eq!(gate.last_verdict(), Some(GateVerdict::NoFace));
    }

    #[test]
    fn test_register_unknown_student() {
        let mut store = MemoryStore::new();
        let err = register_face(&mut store, 5, Embedding::new(vec![0.0; 4])).unwrap_err();
        assert_eq!(err, CaptureError::UnknownStudent(5));
    }
}
