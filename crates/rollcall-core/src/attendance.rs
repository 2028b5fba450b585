//! Attendance records, directions, and minute-precision time of day.

use crate::student::StudentId;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Whether a workflow invocation records arrival or departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    CheckIn,
    CheckOut,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::CheckIn => "check-in",
            Direction::CheckOut => "check-out",
        }
    }
}

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-in" | "checkin" | "in" => Ok(Direction::CheckIn),
            "check-out" | "checkout" | "out" => Ok(Direction::CheckOut),
            other => Err(ParseDirectionError(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown direction {0:?} (expected check-in or check-out)")]
pub struct ParseDirectionError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    #[serde(rename = "Early Leave")]
    EarlyLeave,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::EarlyLeave => "Early Leave",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Present" => Some(AttendanceStatus::Present),
            "Late" => Some(AttendanceStatus::Late),
            "Absent" => Some(AttendanceStatus::Absent),
            "Early Leave" => Some(AttendanceStatus::EarlyLeave),
            _ => None,
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time of day truncated to the minute, written as zero-padded `HH:MM`.
///
/// Ordering matches the lexicographic order of the `HH:MM` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn from_time(time: NaiveTime) -> Self {
        // hour/minute of a valid NaiveTime always form a valid time
        Self(NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time))
    }

    pub fn from_datetime(at: NaiveDateTime) -> Self {
        Self::from_time(at.time())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("invalid time of day {0:?} (expected HH:MM)")]
pub struct ParseTimeError(String);

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(err)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(err());
        }
        let hour: u32 = h.parse().map_err(|_| err())?;
        let minute: u32 = m.parse().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ParseTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// One student's attendance for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub check_in: Option<TimeOfDay>,
    pub check_out: Option<TimeOfDay>,
    pub status: AttendanceStatus,
}

/// Partial update to an attendance record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub check_in: Option<TimeOfDay>,
    pub check_out: Option<TimeOfDay>,
    pub status: Option<AttendanceStatus>,
}

impl AttendanceRecord {
    pub fn apply(&mut self, patch: RecordPatch) {
        if let Some(t) = patch.check_in {
            self.check_in = Some(t);
        }
        if let Some(t) = patch.check_out {
            self.check_out = Some(t);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
    }
}
