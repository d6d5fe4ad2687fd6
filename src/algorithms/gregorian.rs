//! Calendar-aligned durations.
//!
//! A request duration below [`GREGORIAN_THRESHOLD`] is a literal number of
//! milliseconds. At or above it, the value is a sentinel selecting a calendar
//! unit; the counter window then spans from the start of the current UTC unit
//! to the start of the next one.

use chrono::{Datelike, TimeZone, Utc};

const DAY_MS: i64 = 86_400_000;

/// Durations at or above this value are gregorian sentinels, never literal
/// milliseconds (the threshold is roughly 285,000 years).
pub const GREGORIAN_THRESHOLD: i64 = 9_000_000_000_000_000;

/// Window aligned to the current UTC minute.
pub const GREGORIAN_MINUTES: i64 = GREGORIAN_THRESHOLD + 1;
/// Window aligned to the current UTC hour.
pub const GREGORIAN_HOURS: i64 = GREGORIAN_THRESHOLD + 2;
/// Window aligned to the current UTC day.
pub const GREGORIAN_DAYS: i64 = GREGORIAN_THRESHOLD + 3;
/// Window aligned to the current ISO week (Monday 00:00 UTC).
pub const GREGORIAN_WEEKS: i64 = GREGORIAN_THRESHOLD + 4;
/// Window aligned to the current calendar month.
pub const GREGORIAN_MONTHS: i64 = GREGORIAN_THRESHOLD + 5;
/// Window aligned to the current calendar year.
pub const GREGORIAN_YEARS: i64 = GREGORIAN_THRESHOLD + 6;

/// A calendar unit selected by a duration sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GregorianUnit {
    /// UTC minute.
    Minutes,
    /// UTC hour.
    Hours,
    /// UTC day.
    Days,
    /// ISO week starting Monday 00:00 UTC.
    Weeks,
    /// Calendar month.
    Months,
    /// Calendar year.
    Years,
}

/// Decode a duration sentinel. Returns `None` for literal durations or
/// unknown sentinel values.
#[must_use]
pub fn unit_from_duration(duration: i64) -> Option<GregorianUnit> {
    match duration {
        GREGORIAN_MINUTES => Some(GregorianUnit::Minutes),
        GREGORIAN_HOURS => Some(GregorianUnit::Hours),
        GREGORIAN_DAYS => Some(GregorianUnit::Days),
        GREGORIAN_WEEKS => Some(GregorianUnit::Weeks),
        GREGORIAN_MONTHS => Some(GregorianUnit::Months),
        GREGORIAN_YEARS => Some(GregorianUnit::Years),
        _ => None,
    }
}

/// The `[start, end)` unix-millisecond window of the calendar unit
/// containing `now_ms`.
#[must_use]
pub fn window(unit: GregorianUnit, now_ms: i64) -> (i64, i64) {
    match unit {
        GregorianUnit::Minutes => aligned(now_ms, 60_000),
        GregorianUnit::Hours => aligned(now_ms, 3_600_000),
        // Unix time has no leap seconds, so UTC days are a fixed number of
        // milliseconds from the epoch.
        GregorianUnit::Days => aligned(now_ms, DAY_MS),
        GregorianUnit::Weeks => {
            // The epoch fell on a Thursday; shift three days so weeks start
            // on Monday.
            let start = now_ms - (now_ms + 3 * DAY_MS).rem_euclid(7 * DAY_MS);
            (start, start + 7 * DAY_MS)
        }
        GregorianUnit::Months => {
            let (year, month) = year_month(now_ms);
            let start = month_start_ms(year, month);
            let end = if month == 12 {
                month_start_ms(year + 1, 1)
            } else {
                month_start_ms(year, month + 1)
            };
            (start, end)
        }
        GregorianUnit::Years => {
            let (year, _) = year_month(now_ms);
            (month_start_ms(year, 1), month_start_ms(year + 1, 1))
        }
    }
}

/// Start of the next calendar unit after `now_ms`.
#[must_use]
pub fn next_boundary(unit: GregorianUnit, now_ms: i64) -> i64 {
    window(unit, now_ms).1
}

fn aligned(now_ms: i64, span_ms: i64) -> (i64, i64) {
    let start = now_ms - now_ms.rem_euclid(span_ms);
    (start, start + span_ms)
}

fn year_month(now_ms: i64) -> (i32, u32) {
    match Utc.timestamp_millis_opt(now_ms).single() {
        Some(dt) => (dt.year(), dt.month()),
        None => (1970, 1),
    }
}

fn month_start_ms(year: i32, month: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-06-15T10:30:45.500Z
    const NOW: i64 = 1_686_825_045_500;

    #[test]
    fn test_unit_from_duration() {
        assert_eq!(
            unit_from_duration(GREGORIAN_MINUTES),
            Some(GregorianUnit::Minutes)
        );
        assert_eq!(
            unit_from_duration(GREGORIAN_YEARS),
            Some(GregorianUnit::Years)
        );
        assert_eq!(unit_from_duration(60_000), None);
        assert_eq!(unit_from_duration(GREGORIAN_THRESHOLD), None);
    }

    #[test]
    fn test_minute_window() {
        let (start, end) = window(GregorianUnit::Minutes, NOW);
        assert_eq!(start, NOW - 45_500);
        assert_eq!(end - start, 60_000);
        assert!(start <= NOW && NOW < end);
    }

    #[test]
    fn test_hour_and_day_windows() {
        let (start, end) = window(GregorianUnit::Hours, NOW);
        assert_eq!(end - start, 3_600_000);
        assert!(start <= NOW && NOW < end);

        let (start, end) = window(GregorianUnit::Days, NOW);
        assert_eq!(end - start, DAY_MS);
        assert_eq!(start.rem_euclid(DAY_MS), 0);
    }

    #[test]
    fn test_week_starts_on_monday() {
        let (start, end) = window(GregorianUnit::Weeks, NOW);
        assert_eq!(end - start, 7 * DAY_MS);
        assert!(start <= NOW && NOW < end);
        // 2023-06-12 was a Monday.
        assert_eq!(start, 1_686_528_000_000);
    }

    #[test]
    fn test_month_window() {
        let (start, end) = window(GregorianUnit::Months, NOW);
        // 2023-06-01T00:00:00Z .. 2023-07-01T00:00:00Z
        assert_eq!(start, 1_685_577_600_000);
        assert_eq!(end, 1_688_169_600_000);
    }

    #[test]
    fn test_year_window_handles_december() {
        // 2023-12-31T23:59:59Z
        let dec = 1_704_067_199_000;
        let (start, end) = window(GregorianUnit::Years, dec);
        assert_eq!(start, 1_672_531_200_000); // 2023-01-01
        assert_eq!(end, 1_704_067_200_000); // 2024-01-01
        let (_, month_end) = window(GregorianUnit::Months, dec);
        assert_eq!(month_end, end);
    }

    #[test]
    fn test_next_boundary_is_window_end() {
        assert_eq!(
            next_boundary(GregorianUnit::Minutes, NOW),
            window(GregorianUnit::Minutes, NOW).1
        );
        assert!(next_boundary(GregorianUnit::Minutes, NOW) > NOW);
    }
}
