//! Check-in / check-out commits against the attendance book.

use crate::attendance::{AttendanceRecord, AttendanceStatus, Direction, RecordPatch, TimeOfDay};
use crate::settings::Settings;
use crate::store::{AttendanceStore, StoreError, StudentDirectory};
use crate::student::StudentId;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use uuid::Uuid;

/// Default number of entries kept in the recent-activity feed.
pub const DEFAULT_FEED_LEN: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommitError {
    #[error("already checked in at {0}")]
    AlreadyCheckedIn(TimeOfDay),
    #[error("no check-in found for today")]
    NoCheckInFound,
    #[error("student {0} is not in the directory")]
    UnknownStudent(StudentId),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A successful commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub student_id: StudentId,
    pub student_name: String,
    pub direction: Direction,
    pub time: TimeOfDay,
    pub status: AttendanceStatus,
}

impl CommitOutcome {
    pub fn describe(&self) -> String {
        let verb = match self.direction {
            Direction::CheckIn => "checked in",
            Direction::CheckOut => "checked out",
        };
        format!("{} {verb} at {} ({})", self.student_name, self.time, self.status)
    }
}

/// Newest-first feed of recent successful commits.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    entries: VecDeque<CommitOutcome>,
    capacity: usize,
}

impl ActivityFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: CommitOutcome) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> Vec<CommitOutcome> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Applies the check-in/check-out rules and persists the result.
pub struct AttendanceRecorder<S> {
    store: S,
    settings: Settings,
    feed: ActivityFeed,
    session_count: u32,
}

impl<S> AttendanceRecorder<S>
where
    S: StudentDirectory + AttendanceStore,
{
    pub fn new(store: S, settings: Settings, feed_len: usize) -> Self {
        Self {
            store,
            settings,
            feed: ActivityFeed::new(feed_len),
            session_count: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn feed(&self) -> &ActivityFeed {
        &self.feed
    }

    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    pub fn reset_session_count(&mut self) {
        self.session_count = 0;
    }

    pub fn commit(
        &mut self,
        student_id: StudentId,
        direction: Direction,
        now: NaiveDateTime,
    ) -> Result<CommitOutcome, CommitError> {
        let student = self
            .store
            .get_student(student_id)?
            .ok_or(CommitError::UnknownStudent(student_id))?;

        let (time, status) = match direction {
            Direction::CheckIn => self.check_in(student_id, now)?,
            Direction::CheckOut => self.check_out(student_id, now)?,
        };

        let outcome = CommitOutcome {
            student_id,
            student_name: student.full_name(),
            direction,
            time,
            status,
        };
        tracing::info!(
            student_id,
            direction = %direction,
            time = %time,
            status = %status,
            "attendance committed"
        );
        self.feed.push(outcome.clone());
        self.session_count += 1;
        Ok(outcome)
    }

    fn check_in(
        &mut self,
        student_id: StudentId,
        now: NaiveDateTime,
    ) -> Result<(TimeOfDay, AttendanceStatus), CommitError> {
        let date = now.date();
        let time = TimeOfDay::from_datetime(now);
        let status = if time > self.settings.late_time {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        };

        match self.store.find_record(student_id, date)? {
            Some(existing) => {
                if let Some(at) = existing.check_in {
                    return Err(CommitError::AlreadyCheckedIn(at));
                }
                // A record without a check-in (e.g. marked Absent) is filled in.
                self.store.update_record(
                    existing.id,
                    RecordPatch {
                        check_in: Some(time),
                        check_out: None,
                        status: Some(status),
                    },
                )?;
            }
            None => {
                self.store.insert_record(AttendanceRecord {
                    id: Uuid::new_v4(),
                    student_id,
                    date,
                    check_in: Some(time),
                    check_out: None,
                    status,
                })?;
            }
        }
        Ok((time, status))
    }

    fn check_out(
        &mut self,
        student_id: StudentId,
        now: NaiveDateTime,
    ) -> Result<(TimeOfDay, AttendanceStatus), CommitError> {
        let time = TimeOfDay::from_datetime(now);
        let record = self
            .store
            .find_record(student_id, now.date())?
            .filter(|record| record.check_in.is_some())
            .ok_or(CommitError::NoCheckInFound)?;

        let status = if time < self.settings.check_out_time {
            if record.status == AttendanceStatus::Late {
                AttendanceStatus::Late
            } else {
                AttendanceStatus::EarlyLeave
            }
        } else if record.status == AttendanceStatus::Late {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        };

        self.store.update_record(
            record.id,
            RecordPatch {
                check_in: None,
                check_out: Some(time),
                status: Some(status),
            },
        )?;
        Ok((time, status))
    }
}
