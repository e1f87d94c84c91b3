//! Wildcard time matching.
//!
//! Finds the next instant after `now` that satisfies a partial pattern over
//! the six calendar fields. The search walks the fields from year down to
//! second, depth first, trying candidates in ascending order and
//! backtracking when a subtree has no match:
//!
//! ```text
//! year    [2024, 2025]          explicit list, or this year and next
//!  └ month [3, 4, 5]            explicit list, or now.month..=12 / 1..=12
//!     └ day [1..=31]            clipped to the month, filtered by weekday
//!        └ hour [20]
//!           └ minute [30]
//!              └ second [0..=59] first strictly-future hit wins
//! ```
//!
//! A level searches from now's value while every level above equals now,
//! and from the field minimum once any level above has moved past now.

use super::pattern::{TimePattern, convert_day_names, convert_month_names};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::cmp::Ordering;

const YEAR: usize = 0;
const MONTH: usize = 1;
const DAY: usize = 2;
const SECOND: usize = 5;

/// Inclusive bounds for month, day, hour, minute and second.
const BOUNDS: [(u32, u32); 6] = [(0, 0), (1, 12), (1, 31), (0, 23), (0, 59), (0, 59)];

/// A wildcard pattern normalised for searching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WildcardSpec {
    lists: [Option<Vec<u32>>; 6],
    weekdays: Option<Vec<u32>>,
    recurring: bool,
    /// Finest level with an explicit candidate list or weekday filter.
    deepest_listed: Option<usize>,
}

impl WildcardSpec {
    pub(crate) fn from_pattern(pattern: &TimePattern) -> Self {
        let mut months = pattern.monthlist.clone();
        if let Some(names) = &pattern.monthnames {
            months
                .get_or_insert_with(Vec::new)
                .extend(convert_month_names(names));
        }

        let mut weekdays = pattern.dowlist.clone();
        if let Some(names) = &pattern.daynames {
            weekdays
                .get_or_insert_with(Vec::new)
                .extend(convert_day_names(names));
        }

        let years = pattern.yearlist.as_ref().map(|years| {
            years
                .iter()
                .filter_map(|y| u32::try_from(*y).ok())
                .collect::<Vec<u32>>()
        });

        let raw = [
            years,
            months,
            pattern.daylist.clone(),
            pattern.hourlist.clone(),
            pattern.minutelist.clone(),
            pattern.secondlist.clone(),
        ];

        let mut lists: [Option<Vec<u32>>; 6] = Default::default();
        for (level, list) in raw.into_iter().enumerate() {
            lists[level] = list.map(|values| normalise(values, level));
        }

        let weekdays = weekdays.map(|mut w| {
            w.retain(|d| *d < 7);
            w.sort_unstable();
            w.dedup();
            w
        });
        // A weekday constraint fixes the day level.
        let deepest_listed = lists
            .iter()
            .rposition(Option::is_some)
            .max(weekdays.as_ref().map(|_| DAY));

        Self {
            lists,
            weekdays,
            recurring: pattern.recurring,
            deepest_listed,
        }
    }

    /// Find the first instant strictly after `now` matching the pattern.
    pub(crate) fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let now_fields = [
            u32::try_from(now.year()).ok()?,
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
        ];
        let mut fixed = [0u32; 6];
        self.search(&now_fields, &mut fixed, YEAR, false)
    }

    fn search(
        &self,
        now: &[u32; 6],
        fixed: &mut [u32; 6],
        level: usize,
        use_min: bool,
    ) -> Option<NaiveDateTime> {
        let candidates = self.candidates(now, fixed, level, use_min);
        let largest = *candidates.last()?;

        // The latest instant reachable under a prefix is before now exactly
        // when the prefix itself compares below now's prefix.
        fixed[level] = largest;
        if fixed[..=level] < now[..=level] {
            return None;
        }

        for value in candidates {
            fixed[level] = value;
            let ordering = fixed[..=level].cmp(&now[..=level]);

            if ordering == Ordering::Equal
                && self.recurring
                && self.deepest_listed == Some(level)
            {
                continue;
            }

            if level == SECOND {
                if ordering == Ordering::Greater {
                    return to_datetime(fixed);
                }
                continue;
            }

            if let Some(found) = self.search(now, fixed, level + 1, ordering == Ordering::Greater) {
                return Some(found);
            }
        }

        None
    }

    fn candidates(&self, now: &[u32; 6], fixed: &[u32; 6], level: usize, use_min: bool) -> Vec<u32> {
        let start = |level: usize| if use_min { BOUNDS[level].0 } else { now[level] };

        match level {
            YEAR => self.lists[YEAR]
                .clone()
                .unwrap_or_else(|| vec![now[YEAR], now[YEAR] + 1]),
            DAY => {
                let Ok(year) = i32::try_from(fixed[YEAR]) else {
                    return Vec::new();
                };
                let month = fixed[MONTH];
                let last = days_in_month(year, month);
                let mut days: Vec<u32> = match &self.lists[DAY] {
                    Some(list) => list.iter().copied().filter(|d| *d <= last).collect(),
                    None => (start(DAY)..=last).collect(),
                };
                if let Some(weekdays) = &self.weekdays {
                    days.retain(|day| {
                        NaiveDate::from_ymd_opt(year, month, *day)
                            .map(|date| weekdays.contains(&date.weekday().num_days_from_monday()))
                            .unwrap_or(false)
                    });
                }
                days
            }
            _ => match &self.lists[level] {
                Some(list) => list.clone(),
                None => (start(level)..=BOUNDS[level].1).collect(),
            },
        }
    }
}

/// Sort, dedup and drop out-of-range values for `level`.
fn normalise(mut values: Vec<u32>, level: usize) -> Vec<u32> {
    if level != YEAR {
        let (min, max) = BOUNDS[level];
        values.retain(|v| (min..=max).contains(v));
    }
    values.sort_unstable();
    values.dedup();
    values
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn to_datetime(fields: &[u32; 6]) -> Option<NaiveDateTime> {
    let year = i32::try_from(fields[YEAR]).ok()?;
    NaiveDate::from_ymd_opt(year, fields[MONTH], fields[DAY])?.and_hms_opt(
        fields[3],
        fields[4],
        fields[SECOND],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn next(pattern: &TimePattern, now: NaiveDateTime) -> Option<NaiveDateTime> {
        WildcardSpec::from_pattern(pattern).next_after(now)
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 4), 30);
        assert_eq!(days_in_month(2024, 12), 31);
    }

    #[test]
    fn test_deepest_listed_level() {
        let spec = WildcardSpec::from_pattern(&TimePattern::new().with_hours(vec![3]));
        assert_eq!(spec.deepest_listed, Some(3));

        let spec = WildcardSpec::from_pattern(&TimePattern::new().with_month_names(["may"]));
        assert_eq!(spec.deepest_listed, Some(MONTH));

        let spec = WildcardSpec::from_pattern(&TimePattern::new().with_day_names(["friday"]));
        assert_eq!(spec.deepest_listed, Some(DAY));

        let spec = WildcardSpec::from_pattern(
            &TimePattern::new().with_day_names(["friday"]).with_hours(vec![3]),
        );
        assert_eq!(spec.deepest_listed, Some(3));

        assert_eq!(WildcardSpec::from_pattern(&TimePattern::new()).deepest_listed, None);
    }

    #[test]
    fn test_hour_later_today() {
        let p = TimePattern::new().with_hours(vec![20]).recurring();
        assert_eq!(next(&p, at(2024, 3, 15, 10, 0, 0)), Some(at(2024, 3, 15, 20, 0, 0)));
    }

    #[test]
    fn test_recurring_skips_triggering_instant() {
        let p = TimePattern::new().with_hours(vec![20]).recurring();
        assert_eq!(next(&p, at(2024, 3, 15, 20, 0, 0)), Some(at(2024, 3, 16, 20, 0, 0)));
        // A late wake-up inside the same hour still counts as the same firing.
        assert_eq!(next(&p, at(2024, 3, 15, 20, 0, 3)), Some(at(2024, 3, 16, 20, 0, 0)));
    }

    #[test]
    fn test_hour_already_passed_rolls_to_tomorrow() {
        let p = TimePattern::new().with_hours(vec![3]);
        assert_eq!(next(&p, at(2024, 3, 15, 10, 0, 0)), Some(at(2024, 3, 16, 3, 0, 0)));
    }

    #[test]
    fn test_non_recurring_inside_matching_hour_continues_from_now() {
        let p = TimePattern::new().with_hours(vec![10]);
        assert_eq!(next(&p, at(2024, 3, 15, 10, 15, 30)), Some(at(2024, 3, 15, 10, 15, 31)));
    }

    #[test]
    fn test_minute_list_picks_next_slot() {
        let p = TimePattern::new().with_minutes(vec![0, 30]);
        assert_eq!(next(&p, at(2024, 3, 15, 10, 15, 0)), Some(at(2024, 3, 15, 10, 30, 0)));
        assert_eq!(next(&p, at(2024, 3, 15, 10, 45, 0)), Some(at(2024, 3, 15, 11, 0, 0)));
    }

    #[test]
    fn test_month_names_and_time() {
        let p = TimePattern::new()
            .with_month_names(["march", "april", "may"])
            .with_hours(vec![20])
            .with_minutes(vec![30])
            .recurring();
        assert_eq!(next(&p, at(2024, 1, 1, 0, 0, 0)), Some(at(2024, 3, 1, 20, 30, 0)));
        assert_eq!(next(&p, at(2024, 5, 31, 20, 30, 0)), Some(at(2025, 3, 1, 20, 30, 0)));
    }

    #[test]
    fn test_year_boundary() {
        let p = TimePattern::new().with_hours(vec![6]);
        assert_eq!(next(&p, at(2024, 12, 31, 23, 0, 0)), Some(at(2025, 1, 1, 6, 0, 0)));
    }

    #[test]
    fn test_weekday_names() {
        // 2024-03-15 is a Friday.
        let p = TimePattern::new()
            .with_day_names(["tuesday"])
            .with_hours(vec![3])
            .recurring();
        assert_eq!(next(&p, at(2024, 3, 15, 10, 0, 0)), Some(at(2024, 3, 19, 3, 0, 0)));
        // Crossing into the next month.
        assert_eq!(next(&p, at(2024, 3, 26, 3, 0, 0)), Some(at(2024, 4, 2, 3, 0, 0)));
    }

    #[test]
    fn test_recurring_weekday_fires_once_per_week() {
        let p = TimePattern::new().with_day_names(["tuesday"]).recurring();
        let first = next(&p, at(2024, 3, 15, 10, 0, 0));
        assert_eq!(first, Some(at(2024, 3, 19, 0, 0, 0)));
        // Re-resolving at the firing instant moves to the following Tuesday.
        assert_eq!(next(&p, at(2024, 3, 19, 0, 0, 0)), Some(at(2024, 3, 26, 0, 0, 0)));
        // A late wake-up later that day still counts as the same firing.
        assert_eq!(next(&p, at(2024, 3, 19, 0, 0, 2)), Some(at(2024, 3, 26, 0, 0, 0)));
    }

    #[test]
    fn test_last_day_of_month_is_reachable() {
        let p = TimePattern {
            daylist: Some(vec![31]),
            hourlist: Some(vec![12]),
            ..TimePattern::default()
        };
        assert_eq!(next(&p, at(2024, 3, 30, 0, 0, 0)), Some(at(2024, 3, 31, 12, 0, 0)));
        // April has no 31st.
        assert_eq!(next(&p, at(2024, 4, 1, 0, 0, 0)), Some(at(2024, 5, 31, 12, 0, 0)));
    }

    #[test]
    fn test_impossible_pattern() {
        let p = TimePattern {
            monthlist: Some(vec![2]),
            daylist: Some(vec![30]),
            ..TimePattern::default()
        };
        assert_eq!(next(&p, at(2024, 1, 1, 0, 0, 0)), None);

        let p = TimePattern {
            yearlist: Some(vec![2020]),
            ..TimePattern::default()
        };
        assert_eq!(next(&p, at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_exact_now_is_not_a_match() {
        let p = TimePattern::new().with_seconds(vec![0]);
        assert_eq!(next(&p, at(2024, 3, 15, 10, 0, 0)), Some(at(2024, 3, 15, 10, 1, 0)));
    }
}
