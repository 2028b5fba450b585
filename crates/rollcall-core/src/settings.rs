use crate::attendance::TimeOfDay;
use serde::{Deserialize, Serialize};

/// School-day thresholds read by the attendance recorder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Nominal start of the school day. Informational; lateness uses `late_time`.
    pub check_in_time: TimeOfDay,
    /// Check-ins strictly after this minute are Late.
    pub late_time: TimeOfDay,
    /// Check-outs strictly before this minute are Early Leave.
    pub check_out_time: TimeOfDay,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_in_time: hm(8, 0),
            late_time: hm(8, 30),
            check_out_time: hm(16, 0),
        }
    }
}

fn hm(hour: u32, minute: u32) -> TimeOfDay {
    TimeOfDay::new(hour, minute).unwrap_or_else(|| TimeOfDay::from_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.check_in_time.to_string(), "08:00");
        assert_eq!(s.late_time.to_string(), "08:30");
        assert_eq!(s.check_out_time.to_string(), "16:00");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let s: Settings = serde_json::from_str(r#"{"late_time":"09:00"}"#).unwrap();
        assert_eq!(s.late_time.to_string(), "09:00");
        assert_eq!(s.check_out_time.to_string(), "16:00");
    }
}
