//! Time pattern specification.
//!
//! A [`TimePattern`] mixes four independent groups of optional fields:
//!
//! ```text
//! relative   seconds minutes hours days months years        "in 2 hours"
//! absolute   datetime date time                             "2024-05-01 18:00"
//! wildcard   yearlist monthlist daylist hourlist            "every March-May at 20:30"
//!            minutelist secondlist dowlist daynames monthnames
//! jitter     randseconds randminutes randhours randdays     "give or take 10 minutes"
//! ```
//!
//! plus the `recurring` flag used by the scheduler. Any combination may be
//! present; the contributions are summed by
//! [`resolve_offset`](super::resolve_offset).

use serde::{Deserialize, Serialize};
use tracing::warn;

const DAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// A partially specified point (or series of points) in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimePattern {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    /// Approximated as 30 days each.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<i64>,
    /// Approximated as 365 days each.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub yearlist: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthlist: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daylist: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hourlist: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutelist: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondlist: Option<Vec<u32>>,
    /// Days of the week, Monday = 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dowlist: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daynames: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthnames: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub randseconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randminutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randhours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randdays: Option<i64>,

    pub recurring: bool,
}

impl TimePattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recurring(mut self) -> Self {
        self.recurring = true;
        self
    }

    pub fn with_hours(mut self, hours: Vec<u32>) -> Self {
        self.hourlist = Some(hours);
        self
    }

    pub fn with_minutes(mut self, minutes: Vec<u32>) -> Self {
        self.minutelist = Some(minutes);
        self
    }

    pub fn with_seconds(mut self, seconds: Vec<u32>) -> Self {
        self.secondlist = Some(seconds);
        self
    }

    pub fn with_month_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.monthnames = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_day_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.daynames = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn in_seconds(mut self, seconds: i64) -> Self {
        self.seconds = Some(seconds);
        self
    }

    pub fn in_minutes(mut self, minutes: i64) -> Self {
        self.minutes = Some(minutes);
        self
    }

    pub fn has_relative(&self) -> bool {
        [
            self.seconds,
            self.minutes,
            self.hours,
            self.days,
            self.months,
            self.years,
        ]
        .iter()
        .any(Option::is_some)
    }

    pub fn has_absolute(&self) -> bool {
        self.datetime.is_some() || self.date.is_some() || self.time.is_some()
    }

    pub fn has_wildcard(&self) -> bool {
        self.yearlist.is_some()
            || self.monthlist.is_some()
            || self.daylist.is_some()
            || self.hourlist.is_some()
            || self.minutelist.is_some()
            || self.secondlist.is_some()
            || self.dowlist.is_some()
            || self.daynames.is_some()
            || self.monthnames.is_some()
    }

    pub fn has_jitter(&self) -> bool {
        [
            self.randseconds,
            self.randminutes,
            self.randhours,
            self.randdays,
        ]
        .iter()
        .any(Option::is_some)
    }
}

/// Formats used to parse the absolute `datetime`, `date` and `time` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeFormats {
    pub datetime_format: String,
    pub date_format: String,
    pub time_format: String,
}

impl Default for TimeFormats {
    fn default() -> Self {
        Self {
            datetime_format: "%Y-%m-%d %H:%M".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            time_format: "%H:%M".to_string(),
        }
    }
}

/// Convert day names to day-of-week numbers (Monday = 0), in week order.
///
/// Matching is case-insensitive; unknown names are logged and dropped.
pub fn convert_day_names<S: AsRef<str>>(names: &[S]) -> Vec<u32> {
    convert_names(names, &DAY_NAMES, 0, "day")
}

/// Convert month names to month numbers (January = 1), in calendar order.
pub fn convert_month_names<S: AsRef<str>>(names: &[S]) -> Vec<u32> {
    convert_names(names, &MONTH_NAMES, 1, "month")
}

fn convert_names<S: AsRef<str>>(names: &[S], table: &[&str], base: u32, what: &str) -> Vec<u32> {
    let wanted: Vec<String> = names.iter().map(|n| n.as_ref().trim().to_lowercase()).collect();

    let unmatched: Vec<&String> = wanted
        .iter()
        .filter(|name| !table.contains(&name.as_str()))
        .collect();
    if !unmatched.is_empty() {
        warn!(names = ?unmatched, "Could not match {} name", what);
    }

    table
        .iter()
        .zip(base..)
        .filter(|(name, _)| wanted.iter().any(|w| w == *name))
        .map(|(_, number)| number)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_day_names() {
        assert_eq!(convert_day_names(&["Sunday", "monday"]), vec![0, 6]);
        assert_eq!(convert_day_names(&["TUESDAY", "funday"]), vec![1]);
        assert!(convert_day_names::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_convert_month_names() {
        assert_eq!(convert_month_names(&["march", "April", "MAY"]), vec![3, 4, 5]);
        assert_eq!(convert_month_names(&["december", "smarch"]), vec![12]);
    }

    #[test]
    fn test_field_groups() {
        let p = TimePattern::new().with_hours(vec![3]).recurring();
        assert!(p.has_wildcard());
        assert!(!p.has_relative());
        assert!(!p.has_absolute());
        assert!(!p.has_jitter());

        let p = TimePattern::new().in_minutes(1);
        assert!(p.has_relative());
        assert!(!p.has_wildcard());
    }

    #[test]
    fn test_deserialize_original_field_names() {
        let p: TimePattern = serde_json::from_str(
            r#"{"monthnames": ["march", "april", "may"], "hourlist": [20], "minutelist": [30], "recurring": true}"#,
        )
        .unwrap();
        assert_eq!(p.hourlist, Some(vec![20]));
        assert_eq!(p.minutelist, Some(vec![30]));
        assert!(p.recurring);

        let p: TimePattern = toml::from_str("hourlist = [22]\nminutes = 1\n").unwrap();
        assert_eq!(p.minutes, Some(1));
        assert!(!p.recurring);
    }
}
