use crate::models::DateRange;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Calendar unit used to bucket records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" | "1d" => Ok(Granularity::Day),
            "week" | "weekly" | "1w" => Ok(Granularity::Week),
            "month" | "monthly" | "1m" => Ok(Granularity::Month),
            other => Err(format!("unknown window granularity '{}'", other)),
        }
    }
}

/// First day of the month after `date`'s month.
fn next_month_start(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// The unique window containing `date`.
///
/// Weeks are ISO weeks (Monday to Sunday); months follow the calendar, so
/// February is 28 or 29 days long. Returns `None` only at the edge of chrono's
/// representable range.
pub fn window_for(date: NaiveDate, granularity: Granularity) -> Option<DateRange> {
    match granularity {
        Granularity::Day => Some(DateRange::new(date, date.succ_opt()?)),
        Granularity::Week => {
            let offset = date.weekday().num_days_from_monday() as i64;
            let start = date.checked_sub_signed(Duration::days(offset))?;
            let end = start.checked_add_signed(Duration::days(7))?;
            Some(DateRange::new(start, end))
        }
        Granularity::Month => {
            let start = date.with_day(1)?;
            Some(DateRange::new(start, next_month_start(date)?))
        }
    }
}

/// Contiguous windows covering `[range.start, range.end)`.
///
/// The first window is the one containing `range.start` and the last the one
/// containing the day before `range.end`, so the outer edges may extend past
/// the range when it is not calendar-aligned.
pub fn tile(range: DateRange, granularity: Granularity) -> Vec<DateRange> {
    let mut windows = Vec::new();
    if range.start >= range.end {
        return windows;
    }

    let mut cursor = range.start;
    while cursor < range.end {
        match window_for(cursor, granularity) {
            Some(window) => {
                cursor = window.end;
                windows.push(window);
            }
            None => break,
        }
    }
    windows
}

/// Split `range` into consecutive chunks no longer than `span_days`.
pub fn split_range(range: DateRange, span_days: u32) -> Vec<DateRange> {
    let span = Duration::days(span_days.max(1) as i64);
    let mut chunks = Vec::new();
    let mut cursor = range.start;

    while cursor < range.end {
        let next = cursor
            .checked_add_signed(span)
            .map(|d| d.min(range.end))
            .unwrap_or(range.end);
        chunks.push(DateRange::new(cursor, next));
        cursor = next;
    }
    chunks
}
