//! Time engine: converting [`TimePattern`]s into offsets from "now".
//!
//! Every function here is pure apart from [`jitter`] (which draws from the
//! thread RNG) and takes `now` explicitly, so results are reproducible in
//! tests. Times are local wall-clock values without DST handling.

mod pattern;
mod wildcard;

pub use pattern::{TimeFormats, TimePattern, convert_day_names, convert_month_names};

use crate::error::TimeError;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use rand::Rng;
use tracing::{debug, warn};
use wildcard::WildcardSpec;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

/// Current local time, truncated to whole seconds.
pub fn local_now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Sum the relative fields of `pattern` into seconds.
///
/// Months count as 30 days and years as 365. Returns `None` when no relative
/// field is present.
pub fn relative_offset(pattern: &TimePattern) -> Option<i64> {
    if !pattern.has_relative() {
        return None;
    }

    let total = [
        (pattern.seconds, 1),
        (pattern.minutes, MINUTE),
        (pattern.hours, HOUR),
        (pattern.days, DAY),
        (pattern.months, MONTH),
        (pattern.years, YEAR),
    ]
    .into_iter()
    .filter_map(|(value, unit)| value.map(|v| v.saturating_mul(unit)))
    .fold(0i64, i64::saturating_add);

    Some(total)
}

/// Resolve the absolute fields of `pattern` to a point in time.
///
/// `datetime` wins when present. Otherwise `date` and `time` combine; a date
/// alone means midnight and a time alone anchors to today's date.
pub fn absolute_target(
    pattern: &TimePattern,
    now: NaiveDateTime,
    formats: &TimeFormats,
) -> Result<Option<NaiveDateTime>, TimeError> {
    if let Some(value) = &pattern.datetime {
        return NaiveDateTime::parse_from_str(value, &formats.datetime_format)
            .map(Some)
            .map_err(|_| invalid(value, &formats.datetime_format));
    }

    let date = pattern
        .date
        .as_deref()
        .map(|value| {
            NaiveDate::parse_from_str(value, &formats.date_format)
                .map_err(|_| invalid(value, &formats.date_format))
        })
        .transpose()?;

    let time = pattern
        .time
        .as_deref()
        .map(|value| {
            NaiveTime::parse_from_str(value, &formats.time_format)
                .map_err(|_| invalid(value, &formats.time_format))
        })
        .transpose()?;

    Ok(match (date, time) {
        (Some(date), Some(time)) => Some(date.and_time(time)),
        (Some(date), None) => Some(date.and_time(NaiveTime::MIN)),
        (None, Some(time)) => Some(now.date().and_time(time)),
        (None, None) => None,
    })
}

/// Seconds between `now` and the absolute point described by `pattern`.
///
/// The result is negative when that point is already past.
pub fn absolute_offset(
    pattern: &TimePattern,
    now: NaiveDateTime,
    formats: &TimeFormats,
) -> Result<Option<i64>, TimeError> {
    Ok(absolute_target(pattern, now, formats)?.map(|target| (target - now).num_seconds()))
}

fn invalid(value: &str, format: &str) -> TimeError {
    TimeError::InvalidFormat {
        value: value.to_string(),
        format: format.to_string(),
    }
}

/// Next instant strictly after `now` matching the wildcard fields of `pattern`.
///
/// Returns `None` when the pattern has no wildcard fields or can never match.
pub fn match_wildcard(pattern: &TimePattern, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if !pattern.has_wildcard() {
        return None;
    }
    let found = WildcardSpec::from_pattern(pattern).next_after(now);
    match found {
        Some(at) => debug!(%now, %at, "Matched wildcard time"),
        None => debug!(%now, "Wildcard time never occurs"),
    }
    found
}

/// Size of the jitter window in seconds, if any jitter field is set.
fn jitter_window(pattern: &TimePattern) -> Option<i64> {
    if !pattern.has_jitter() {
        return None;
    }
    let window = [
        (pattern.randseconds, 1),
        (pattern.randminutes, MINUTE),
        (pattern.randhours, HOUR),
        (pattern.randdays, DAY),
    ]
    .into_iter()
    .filter_map(|(value, unit)| value.map(|v| v.saturating_mul(unit)))
    .fold(0i64, i64::saturating_add);
    Some(window.saturating_abs())
}

/// Randomly shift `seconds` by up to the pattern's jitter window either way.
pub fn jitter(pattern: &TimePattern, seconds: i64) -> i64 {
    jitter_with(pattern, seconds, &mut rand::thread_rng())
}

/// [`jitter`] with an explicit random source.
///
/// The result is clamped at zero. Without jitter fields `seconds` is
/// returned unchanged.
pub fn jitter_with<R: Rng + ?Sized>(pattern: &TimePattern, seconds: i64, rng: &mut R) -> i64 {
    match jitter_window(pattern) {
        Some(window) if window > 0 => {
            let shift = rng.gen_range(-window..=window);
            debug!(window, shift, "Adjusting time randomly");
            seconds.saturating_add(shift).max(0)
        }
        _ => seconds,
    }
}

/// Resolve `pattern` to an offset in seconds from `now`, using the default
/// [`TimeFormats`].
pub fn resolve_offset(pattern: &TimePattern, now: NaiveDateTime) -> Option<i64> {
    resolve_offset_with(pattern, now, &TimeFormats::default())
}

/// Resolve `pattern` to an offset in seconds from `now`.
///
/// Relative, absolute and wildcard contributions are summed, then jitter is
/// applied. Returns `None` if no field contributed, if an absolute field does
/// not parse, or if a wildcard pattern can never match.
pub fn resolve_offset_with(
    pattern: &TimePattern,
    now: NaiveDateTime,
    formats: &TimeFormats,
) -> Option<i64> {
    let mut total: Option<i64> = relative_offset(pattern);

    match absolute_offset(pattern, now, formats) {
        Ok(Some(offset)) => total = Some(total.unwrap_or(0).saturating_add(offset)),
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable time pattern");
            return None;
        }
    }

    if pattern.has_wildcard() {
        let at = match_wildcard(pattern, now)?;
        let offset = (at - now).num_seconds();
        total = Some(total.unwrap_or(0).saturating_add(offset));
    }

    total.map(|seconds| jitter(pattern, seconds))
}

/// `now` moved forward by `seconds`, or `None` past the calendar's range.
pub fn target_after(now: NaiveDateTime, seconds: i64) -> Option<NaiveDateTime> {
    TimeDelta::try_seconds(seconds).and_then(|delta| now.checked_add_signed(delta))
}

/// Describe an elapsed duration in its coarsest whole unit, e.g. `"3 hours"`.
///
/// Units run from seconds to months (30 days); there is no year unit, so
/// long spans keep counting months. Negative input counts as zero.
pub fn humanize_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (value, unit) = if seconds < MINUTE {
        (seconds, "second")
    } else if seconds < HOUR {
        (seconds / MINUTE, "minute")
    } else if seconds < DAY {
        (seconds / HOUR, "hour")
    } else if seconds < WEEK {
        (seconds / DAY, "day")
    } else if seconds < MONTH {
        (seconds / WEEK, "week")
    } else {
        (seconds / MONTH, "month")
    };

    if value > 1 {
        format!("{value} {unit}s")
    } else {
        format!("{value} {unit}")
    }
}

/// How long ago `timestamp` was, relative to `now`.
pub fn humanize_since(timestamp: NaiveDateTime, now: NaiveDateTime) -> String {
    humanize_elapsed((now - timestamp).num_seconds())
}
