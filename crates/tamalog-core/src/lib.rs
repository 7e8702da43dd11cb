//! Core domain model for tamalog.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tamalog-core";

/// Prefix carried by every error-marker value. Upstream weather text and
/// delay-status values never start with this, so downstream consumers can
/// tell "source errored" apart from legitimate data.
pub const ERROR_MARKER_PREFIX: &str = "error: ";

/// One collection cycle's result: a single row of `transport_weather`.
///
/// Date and time are local wall-clock strings captured once at cycle start.
/// Rows are append-only; the surrogate id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub captured_date: String,
    pub captured_time: String,
    pub weather_value: String,
    pub delay_status_value: String,
}

impl Observation {
    /// Build an observation stamped from a single timestamp, so date and
    /// time can never straddle midnight within one cycle.
    pub fn at(now: DateTime<Local>, weather_value: String, delay_status_value: String) -> Self {
        Self {
            captured_date: now.format("%Y-%m-%d").to_string(),
            captured_time: now.format("%H:%M:%S").to_string(),
            weather_value,
            delay_status_value,
        }
    }
}

/// Normalized transit delay status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayStatus {
    Normal,
    Delayed,
}

impl DelayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Delayed => "delayed",
        }
    }
}

impl fmt::Display for DelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One data line of the bulk snapshot file. The id is explicit, taken from
/// the file, and wins on first occurrence; later collisions are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRow {
    pub id: i64,
    pub area_name: String,
    pub date: String,
    pub weather_desc: String,
}

/// Convert a fetch/parse failure into the tagged placeholder stored in
/// place of the missing field.
pub fn error_marker(cause: &impl fmt::Display) -> String {
    format!("{ERROR_MARKER_PREFIX}{cause}")
}

pub fn is_error_marker(value: &str) -> bool {
    value.starts_with(ERROR_MARKER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn observation_uses_one_timestamp_for_both_fields() {
        let now = Local.with_ymd_and_hms(2026, 3, 1, 23, 59, 58).unwrap();
        let obs = Observation::at(now, "晴れ".into(), DelayStatus::Normal.to_string());
        assert_eq!(obs.captured_date, "2026-03-01");
        assert_eq!(obs.captured_time, "23:59:58");
        assert_eq!(obs.delay_status_value, "normal");
    }

    #[test]
    fn error_markers_are_distinguishable_from_values() {
        let marker = error_marker(&"http status 503 for https://example.test");
        assert!(is_error_marker(&marker));
        assert!(!is_error_marker("晴れ時々曇り"));
        assert!(!is_error_marker(DelayStatus::Delayed.as_str()));
    }
}
