//! rollcall-core — Face-match attendance workflow.
//!
//! Matches face embeddings against enrolled students, gates enrollment
//! captures, and records check-ins/check-outs. Detection is a pluggable
//! capability; an SCRFD + embedding-model pipeline over ONNX Runtime is
//! provided.

pub mod attendance;
pub mod detector;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod recognizer;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod store;
pub mod student;
pub mod types;

pub use attendance::{AttendanceRecord, AttendanceStatus, Direction, TimeOfDay};
pub use detector::{DetectorError, FaceDetector};
pub use matcher::{FaceMatcher, LabeledEmbedding, MatchOutcome};
pub use pipeline::OnnxPipeline;
pub use quality::{CaptureError, GateVerdict, RegistrationGate};
pub use recorder::{AttendanceRecorder, CommitError, CommitOutcome};
pub use session::{RecognitionSession, SessionSnapshot, WorkflowTimings};
pub use settings::Settings;
pub use store::{AttendanceStore, MemoryStore, StoreError, StudentDirectory};
pub use student::{NewStudent, Student, StudentId, StudentStatus};
pub use types::{BoundingBox, Detection, Embedding, EMBEDDING_DIM};

use std::path::PathBuf;

/// Where model files live when no directory is configured.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
