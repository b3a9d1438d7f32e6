//! On-time / late classification against the school's late cutoff.

use crate::types::{format_time, truncate_to_seconds, AttendanceStatus};
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_CUTOFF_HMS: (u32, u32, u32) = (7, 0, 0);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid late cutoff {0:?}: expected HH:MM:SS")]
pub struct CutoffParseError(pub String);

/// Time of day after which an arrival counts as late.
///
/// Stored as a `NaiveTime` at whole-second precision and always rendered as
/// zero-padded `HH:MM:SS`, so ordering never depends on string formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LateCutoff(NaiveTime);

impl LateCutoff {
    pub fn new(time: NaiveTime) -> Self {
        Self(truncate_to_seconds(time))
    }

    /// `Late` iff the time of day of `now` (whole seconds) is strictly after the cutoff.
    pub fn classify(&self, now: NaiveDateTime) -> AttendanceStatus {
        if truncate_to_seconds(now.time()) > self.0 {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::OnTime
        }
    }
}

impl Default for LateCutoff {
    fn default() -> Self {
        let (h, m, s) = DEFAULT_CUTOFF_HMS;
        Self(NaiveTime::from_hms_opt(h, m, s).unwrap_or(NaiveTime::MIN))
    }
}

impl FromStr for LateCutoff {
    type Err = CutoffParseError;

    /// Accepts `HH:MM:SS` and, for settings rows written without seconds, `HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
            .map(Self::new)
            .map_err(|_| CutoffParseError(s.to_string()))
    }
}

impl TryFrom<String> for LateCutoff {
    type Error = CutoffParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LateCutoff> for String {
    fn from(cutoff: LateCutoff) -> Self {
        cutoff.to_string()
    }
}

impl std::fmt::Display for LateCutoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_time(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_default_cutoff() {
        assert_eq!(LateCutoff::default().to_string(), "07:00:00");
    }

    #[test]
    fn test_one_second_after_cutoff_is_late() {
        let cutoff = LateCutoff::default();
        assert_eq!(cutoff.classify(at(7, 0, 1)), AttendanceStatus::Late);
    }

    #[test]
    fn test_one_second_before_cutoff_is_on_time() {
        let cutoff = LateCutoff::default();
        assert_eq!(cutoff.classify(at(6, 59, 59)), AttendanceStatus::OnTime);
    }

    #[test]
    fn test_exact_cutoff_is_on_time() {
        let cutoff = LateCutoff::default();
        assert_eq!(cutoff.classify(at(7, 0, 0)), AttendanceStatus::OnTime);
    }

    #[test]
    fn test_subsecond_past_cutoff_is_on_time() {
        let cutoff = LateCutoff::default();
        let now = NaiveDate::from_ymd_opt(2024, 7, 15)
            .unwrap()
            .and_hms_milli_opt(7, 0, 0, 999)
            .unwrap();
        assert_eq!(cutoff.classify(now), AttendanceStatus::OnTime);
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!("07:30:00".parse::<LateCutoff>().unwrap().to_string(), "07:30:00");
        assert_eq!("7:30".parse::<LateCutoff>().unwrap().to_string(), "07:30:00");
        assert_eq!(" 06:45:10 ".parse::<LateCutoff>().unwrap().to_string(), "06:45:10");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("seven".parse::<LateCutoff>().is_err());
        assert!("25:00:00".parse::<LateCutoff>().is_err());
    }

    #[test]
    fn test_unpadded_hour_compares_chronologically() {
        // "9:00" would sort after "10:00" as a string.
        let cutoff: LateCutoff = "9:00".parse().unwrap();
        assert_eq!(cutoff.classify(at(10, 0, 0)), AttendanceStatus::Late);
        assert_eq!(cutoff.classify(at(8, 59, 0)), AttendanceStatus::OnTime);
    }
}
