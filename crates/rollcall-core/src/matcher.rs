//! Nearest-neighbour identification against enrolled face descriptors.

use crate::student::{Student, StudentId};
use crate::types::Embedding;
use serde::Serialize;

/// An enrolled face the matcher can return.
#[derive(Debug, Clone)]
pub struct LabeledEmbedding {
    pub student_id: StudentId,
    /// Display name for the overlay and status text.
    pub label: String,
    pub embedding: Embedding,
}

impl LabeledEmbedding {
    pub fn from_student(student: &Student, embedding: Embedding) -> Self {
        Self {
            student_id: student.id,
            label: student.full_name(),
            embedding,
        }
    }
}

/// Result of matching one query embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MatchOutcome {
    Known {
        student_id: StudentId,
        label: String,
        distance: f32,
    },
    Unknown,
}

impl MatchOutcome {
    pub fn is_known(&self) -> bool {
        matches!(self, MatchOutcome::Known { .. })
    }
}

/// Display confidence for an embedding distance, as a whole percentage.
pub fn confidence(distance: f32) -> u8 {
    ((1.0 - distance) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// L2 nearest-neighbour matcher over a fixed gallery snapshot.
///
/// The gallery is sorted by student id at build time. Only a strictly
/// smaller distance replaces the current best, so equal distances resolve
/// to the lowest id.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    gallery: Vec<LabeledEmbedding>,
    distance_threshold: f32,
}

impl FaceMatcher {
    pub fn build(mut gallery: Vec<LabeledEmbedding>, distance_threshold: f32) -> Self {
        gallery.sort_by_key(|e| e.student_id);
        tracing::debug!(
            entries = gallery.len(),
            distance_threshold,
            "face matcher built"
        );
        Self {
            gallery,
            distance_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    pub fn find_match(&self, query: &Embedding) -> MatchOutcome {
        let mut best: Option<(&LabeledEmbedding, f32)> = None;

        for entry in &self.gallery {
            if entry.embedding.len() != query.len() {
                tracing::debug!(
                    student_id = entry.student_id,
                    stored = entry.embedding.len(),
                    query = query.len(),
                    "skipping descriptor with mismatched length"
                );
                continue;
            }
            let distance = query.euclidean_distance(&entry.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((entry, distance));
            }
        }

        match best {
            Some((entry, distance)) if distance <= self.distance_threshold => MatchOutcome::Known {
                student_id: entry.student_id,
                label: entry.label.clone(),
                distance,
            },
            _ => MatchOutcome::Unknown,
        }
    }
}
