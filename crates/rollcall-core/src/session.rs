//! Recognition session: turns a stream of per-frame detections into at most
//! one attendance commit at a time.
//!
//! The session is a pure state machine. The caller owns the clock and the
//! I/O: it asks [`RecognitionSession::begin_detection`] before sampling a
//! frame, feeds results to [`RecognitionSession::on_detections`], sleeps
//! until [`RecognitionSession::next_deadline`], then calls
//! [`RecognitionSession::poll`] to collect a due commit.

use crate::attendance::Direction;
use crate::matcher::{confidence, FaceMatcher, MatchOutcome};
use crate::recorder::{CommitError, CommitOutcome};
use crate::student::StudentId;
use crate::types::{BoundingBox, Detection};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Timer settings for the recognition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowTimings {
    /// How often a frame is sampled.
    pub tick_interval: Duration,
    /// Minimum time between two triggers for the same student.
    pub cooldown: Duration,
    /// Delay between locking a candidate and committing.
    pub commit_delay: Duration,
    /// How long the commit result stays on screen before returning to Ready.
    pub settle_delay: Duration,
}

impl Default for WorkflowTimings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            cooldown: Duration::from_secs(8),
            commit_delay: Duration::from_millis(500),
            settle_delay: Duration::from_secs(2),
        }
    }
}

/// The locked identity awaiting or undergoing a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub student_id: StudentId,
    pub name: String,
    pub confidence: u8,
}

/// One face drawn on the overlay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayFace {
    pub bbox: BoundingBox,
    pub student_id: Option<StudentId>,
    pub label: Option<String>,
    pub confidence: Option<u8>,
}

/// Request emitted when a pending candidate's delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRequest {
    pub student_id: StudentId,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Ready,
    PendingCommit { candidate: Candidate, due: Instant },
    Committing { candidate: Candidate },
    Settling { until: Instant },
    Error,
}

/// Coarse phase name for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Ready,
    PendingCommit,
    Committing,
    Settling,
    Error,
}

/// Point-in-time view of a session, published to status readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub direction: Direction,
    pub phase: PhaseKind,
    pub message: String,
    pub candidate: Option<Candidate>,
    pub overlay: Vec<OverlayFace>,
    pub enrolled: usize,
}

impl SessionSnapshot {
    /// Placeholder published while the camera and models are loading.
    pub fn starting(direction: Direction) -> Self {
        Self {
            direction,
            phase: PhaseKind::Ready,
            message: "starting camera".into(),
            candidate: None,
            overlay: Vec::new(),
            enrolled: 0,
        }
    }

    /// Snapshot for a session that could not start.
    pub fn failed(direction: Direction, message: impl Into<String>) -> Self {
        Self {
            direction,
            phase: PhaseKind::Error,
            message: message.into(),
            candidate: None,
            overlay: Vec::new(),
            enrolled: 0,
        }
    }
}

pub struct RecognitionSession {
    direction: Direction,
    matcher: FaceMatcher,
    timings: WorkflowTimings,
    phase: Phase,
    cooldowns: HashMap<StudentId, Instant>,
    detecting: bool,
    overlay: Vec<OverlayFace>,
    message: String,
    candidate: Option<Candidate>,
}

impl RecognitionSession {
    pub fn new(direction: Direction, matcher: FaceMatcher, timings: WorkflowTimings) -> Self {
        Self {
            direction,
            matcher,
            timings,
            phase: Phase::Ready,
            cooldowns: HashMap::new(),
            detecting: false,
            overlay: Vec::new(),
            message: ready_message(direction),
            candidate: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timings(&self) -> WorkflowTimings {
        self.timings
    }

    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Error
    }

    /// Whether a commit is pending or executing.
    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Ready | Phase::Error)
    }

    /// Claim the detector for this tick. Returns false when a detection is
    /// already outstanding or the session has failed; the tick is skipped.
    pub fn begin_detection(&mut self) -> bool {
        if self.detecting || self.is_failed() {
            return false;
        }
        self.detecting = true;
        true
    }

    /// Release the detector after a failed detection. The failure is the
    /// caller's to log; the next tick proceeds normally.
    pub fn abort_detection(&mut self) {
        self.detecting = false;
    }

    /// Process one frame's detections. Returns the candidate if this frame
    /// locked one.
    pub fn on_detections(&mut self, now: Instant, detections: &[Detection]) -> Option<Candidate> {
        self.detecting = false;
        if self.is_failed() {
            return None;
        }

        let matches: Vec<MatchOutcome> = detections
            .iter()
            .map(|d| self.matcher.find_match(&d.embedding))
            .collect();

        self.overlay = detections
            .iter()
            .zip(&matches)
            .map(|(d, m)| match m {
                MatchOutcome::Known { student_id, label, distance } => OverlayFace {
                    bbox: d.bbox,
                    student_id: Some(*student_id),
                    label: Some(label.clone()),
                    confidence: Some(confidence(*distance)),
                },
                MatchOutcome::Unknown => OverlayFace {
                    bbox: d.bbox,
                    student_id: None,
                    label: None,
                    confidence: None,
                },
            })
            .collect();

        if self.phase != Phase::Ready {
            // Recognitions while a commit is pending or settling are dropped.
            return None;
        }

        if detections.is_empty() {
            self.candidate = None;
            self.message = ready_message(self.direction);
            return None;
        }

        let timings = self.timings;
        let cooldowns = &self.cooldowns;
        let locked = matches.into_iter().find_map(|m| match m {
            MatchOutcome::Known { student_id, label, distance } => {
                let cooled = cooldowns
                    .get(&student_id)
                    .map_or(true, |last| now.saturating_duration_since(*last) >= timings.cooldown);
                cooled.then(|| Candidate {
                    student_id,
                    name: label,
                    confidence: confidence(distance),
                })
            }
            MatchOutcome::Unknown => None,
        });

        let Some(candidate) = locked else {
            self.candidate = None;
            self.message = waiting_message(self.direction);
            return None;
        };

        tracing::info!(
            student_id = candidate.student_id,
            confidence = candidate.confidence,
            direction = %self.direction,
            "candidate locked"
        );
        self.cooldowns.insert(candidate.student_id, now);
        self.message = format!("recognized {} ({}%)", candidate.name, candidate.confidence);
        self.candidate = Some(candidate.clone());
        self.phase = Phase::PendingCommit {
            candidate: candidate.clone(),
            due: now + self.timings.commit_delay,
        };
        Some(candidate)
    }

    /// The next instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::PendingCommit { due, .. } => Some(*due),
            Phase::Settling { until } => Some(*until),
            _ => None,
        }
    }

    /// Advance timers. Returns a commit request exactly once per locked
    /// candidate, when its delay has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<CommitRequest> {
        match &self.phase {
            Phase::PendingCommit { candidate, due } if now >= *due => {
                let candidate = candidate.clone();
                let request = CommitRequest {
                    student_id: candidate.student_id,
                    direction: self.direction,
                };
                self.message = format!("recording {} for {}", self.direction, candidate.name);
                self.phase = Phase::Committing { candidate };
                Some(request)
            }
            Phase::Settling { until } if now >= *until => {
                self.phase = Phase::Ready;
                self.candidate = None;
                self.message = ready_message(self.direction);
                None
            }
            _ => None,
        }
    }

    /// Record the result of the commit issued by [`poll`](Self::poll).
    pub fn on_commit_result(&mut self, now: Instant, result: &Result<CommitOutcome, CommitError>) {
        let Phase::Committing { candidate } = &self.phase else {
            tracing::warn!("commit result arrived with no commit in flight; ignoring");
            return;
        };
        self.message = match result {
            Ok(outcome) => outcome.describe(),
            Err(err) => {
                tracing::info!(student_id = candidate.student_id, error = %err, "commit rejected");
                format!("{}: {err}", candidate.name)
            }
        };
        self.phase = Phase::Settling {
            until: now + self.timings.settle_delay,
        };
    }

    /// Enter the terminal error state.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.message = message.into();
        tracing::error!(message = %self.message, "recognition session failed");
        self.phase = Phase::Error;
        self.detecting = false;
        self.candidate = None;
        self.overlay.clear();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            direction: self.direction,
            phase: match self.phase {
                Phase::Ready => PhaseKind::Ready,
                Phase::PendingCommit { .. } => PhaseKind::PendingCommit,
                Phase::Committing { .. } => PhaseKind::Committing,
                Phase::Settling { .. } => PhaseKind::Settling,
                Phase::Error => PhaseKind::Error,
            },
            message: self.message.clone(),
            candidate: self.candidate.clone(),
            overlay: self.overlay.clone(),
            enrolled: self.matcher.len(),
        }
    }
}

fn ready_message(direction: Direction) -> String {
    format!("ready for {direction}")
}

fn waiting_message(direction: Direction) -> String {
    format!("face not recognized; waiting for {direction} scan")
}
