//! Student roster entries.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};

pub type StudentId = i64;

/// Lifecycle status of a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    #[default]
    Active,
    Inactive,
    Graduated,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::Inactive => "inactive",
            StudentStatus::Graduated => "graduated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(StudentStatus::Active),
            "inactive" => Some(StudentStatus::Inactive),
            "graduated" => Some(StudentStatus::Graduated),
            _ => None,
        }
    }
}

/// A student record as held by the directory.
///
/// Face registration is derived from the descriptor, so a student is
/// registered exactly when a descriptor is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    /// Human-readable student code (e.g. "S-2024-017").
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    pub class_level: String,
    pub room: String,
    #[serde(default)]
    pub status: StudentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_descriptor: Option<Embedding>,
}

impl Student {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn face_registered(&self) -> bool {
        self.face_descriptor.is_some()
    }

    pub fn apply(&mut self, patch: StudentPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        match patch.face {
            Some(FaceUpdate::Register(embedding)) => self.face_descriptor = Some(embedding),
            Some(FaceUpdate::Clear) => self.face_descriptor = None,
            None => {}
        }
    }
}

/// Fields for a student that does not exist yet; the directory assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStudent {
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub class_level: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub status: StudentStatus,
}

impl NewStudent {
    pub fn into_student(self, id: StudentId) -> Student {
        Student {
            id,
            code: self.code,
            first_name: self.first_name,
            last_name: self.last_name,
            class_level: self.class_level,
            room: self.room,
            status: self.status,
            face_descriptor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaceUpdate {
    Register(Embedding),
    Clear,
}

/// Partial update to a student.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudentPatch {
    pub status: Option<StudentStatus>,
    pub face: Option<FaceUpdate>,
}

impl StudentPatch {
    pub fn register_face(embedding: Embedding) -> Self {
        Self {
            face: Some(FaceUpdate::Register(embedding)),
            ..Default::default()
        }
    }

    pub fn clear_face() -> Self {
        Self {
            face: Some(FaceUpdate::Clear),
            ..Default::default()
        }
    }
}
