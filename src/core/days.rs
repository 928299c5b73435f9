use chrono::{Datelike, Days, NaiveDate};

/// Calendar day used by every scheduled-date field.
pub type Day = NaiveDate;

/// Lower bound for date scans.
pub const MIN_DAY: Day = NaiveDate::MIN;

/// Upper bound for date scans.
pub const MAX_DAY: Day = NaiveDate::MAX;

pub fn plus_days(day: Day, n: u64) -> Day {
    day.checked_add_days(Days::new(n)).unwrap_or(MAX_DAY)
}

pub fn minus_days(day: Day, n: u64) -> Day {
    day.checked_sub_days(Days::new(n)).unwrap_or(MIN_DAY)
}

/// Shifts a purge date into the far future, past any purge window, while
/// keeping the original date recoverable with [`restamp_origin`].
pub fn restamp_far(day: Day, offset_days: u64) -> Day {
    plus_days(day, offset_days)
}

pub fn restamp_origin(day: Day, offset_days: u64) -> Day {
    minus_days(day, offset_days)
}

/// 1-based day of month.
pub fn day_of_month(day: Day) -> u32 {
    day.day()
}

/// Number of whole months from `from` to `to` (0 when same month or `to` earlier).
pub fn months_between(from: Day, to: Day) -> u32 {
    let a = from.year() * 12 + from.month0() as i32;
    let b = to.year() * 12 + to.month0() as i32;
    (b - a).max(0) as u32
}

pub fn days_between(from: Day, to: Day) -> u32 {
    (to - from).num_days().max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, dd: u32) -> Day {
        NaiveDate::from_ymd_opt(y, m, dd).unwrap()
    }

    #[test]
    fn restamp_is_reversible() {
        let day = d(2026, 3, 14);
        let far = restamp_far(day, 1_000_000);
        assert!(far > d(4000, 1, 1));
        assert_eq!(restamp_origin(far, 1_000_000), day);
    }

    #[test]
    fn month_arithmetic() {
        assert_eq!(months_between(d(2026, 1, 31), d(2026, 2, 1)), 1);
        assert_eq!(months_between(d(2025, 12, 1), d(2026, 2, 1)), 2);
        assert_eq!(months_between(d(2026, 2, 1), d(2026, 1, 1)), 0);
        assert_eq!(days_between(d(2026, 2, 1), d(2026, 2, 8)), 7);
    }
}
