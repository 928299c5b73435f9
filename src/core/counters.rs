// ============================================================================
// Usage counters
// ============================================================================
//
// Raw magnitudes (note counts, byte volumes, consumption) are kept exactly
// for the current period. History is compressed to one byte per period with
// a logarithmic scale: `pow(log(v))` is monotonic but lossy, so comparisons
// are always made inside one domain (both raw or both logged).
// ============================================================================

use super::days::{Day, day_of_month, days_between, months_between};
use crate::config::QuotaThresholds;
use serde::{Deserialize, Serialize};

pub const LOG_BASE: f64 = 1.15;

/// Notes per `q1` quota unit.
pub const UNIT_V1: u64 = 250;
/// Bytes per `q2` quota unit.
pub const UNIT_V2: u64 = 100_000_000;
/// Consumption units per `qc` quota unit (monthly).
pub const UNIT_CONSUMPTION: u64 = 1_000_000;

const HISTORY_MONTHS: usize = 12;
const HISTORY_DAYS: usize = 7;

/// Maps a raw magnitude to the compressed one-byte scale.
pub fn log(v: u64) -> u8 {
    if v == 0 {
        return 0;
    }
    let l = 1.0 + (v as f64).ln() / LOG_BASE.ln();
    l.round().min(255.0) as u8
}

/// Approximate inverse of [`log`].
pub fn pow(l: u8) -> u64 {
    if l == 0 {
        return 0;
    }
    LOG_BASE.powi(l as i32 - 1).round() as u64
}

/// Flags derived from an account's live counters, consulted by operations
/// and by the lifecycle throttle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionFlags {
    pub rate_limited: bool,
    pub minimal_access: bool,
    pub read_only: bool,
    pub near_quota: bool,
}

impl AdmissionFlags {
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-account summary rolled up into partitions and the tenant synthesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub q1: u32,
    pub q2: u32,
    pub qc: u32,
    pub v1: u64,
    pub v2: u64,
    pub consumption: u64,
}

impl UsageSummary {
    pub fn add(&mut self, other: &UsageSummary) {
        self.q1 = self.q1.saturating_add(other.q1);
        self.q2 = self.q2.saturating_add(other.q2);
        self.qc = self.qc.saturating_add(other.qc);
        self.v1 = self.v1.saturating_add(other.v1);
        self.v2 = self.v2.saturating_add(other.v2);
        self.consumption = self.consumption.saturating_add(other.consumption);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Day of the last update; history rolls forward from it.
    pub stamp: Option<Day>,
    pub q1: u32,
    pub q2: u32,
    pub qc: u32,
    pub v1: u64,
    pub v2: u64,
    /// Running means over the current month.
    pub v1m: u64,
    pub v2m: u64,
    pub cons_month: u64,
    /// Logged consumption of previous months, `[0]` = last month.
    pub months: [u8; HISTORY_MONTHS],
    pub transfer_today: u64,
    /// Logged transfer volume of previous days, `[0]` = yesterday.
    pub transfers: [u8; HISTORY_DAYS],
}

impl Counters {
    pub fn with_quotas(q1: u32, q2: u32, qc: u32) -> Self {
        Self {
            q1,
            q2,
            qc,
            ..Self::default()
        }
    }

    /// Shifts histories forward to `today`.
    pub fn roll(&mut self, today: Day) {
        let Some(stamp) = self.stamp else {
            self.stamp = Some(today);
            self.v1m = self.v1;
            self.v2m = self.v2;
            return;
        };

        let months = months_between(stamp, today) as usize;
        if months > 0 {
            shift_in(&mut self.months, log(self.cons_month), months);
            self.cons_month = 0;
            self.v1m = self.v1;
            self.v2m = self.v2;
        }

        let days = days_between(stamp, today) as usize;
        if days > 0 {
            shift_in(&mut self.transfers, log(self.transfer_today), days);
            self.transfer_today = 0;
        }

        if today > stamp {
            self.stamp = Some(today);
        }
    }

    pub fn add_v1(&mut self, delta: i64, today: Day) {
        self.roll(today);
        self.v1 = apply_delta(self.v1, delta);
        self.v1m = running_mean(self.v1m, self.v1, day_of_month(today) as u64);
    }

    pub fn add_v2(&mut self, delta: i64, today: Day) {
        self.roll(today);
        self.v2 = apply_delta(self.v2, delta);
        self.v2m = running_mean(self.v2m, self.v2, day_of_month(today) as u64);
    }

    pub fn record_consumption(&mut self, amount: u64, today: Day) {
        self.roll(today);
        self.cons_month = self.cons_month.saturating_add(amount);
    }

    pub fn record_transfer(&mut self, bytes: u64, today: Day) {
        self.roll(today);
        self.transfer_today = self.transfer_today.saturating_add(bytes);
    }

    /// Approximate transfer volume over the last seven days.
    pub fn transfers_7d(&self) -> u64 {
        self.transfers
            .iter()
            .take(HISTORY_DAYS - 1)
            .map(|l| pow(*l))
            .fold(self.transfer_today, u64::saturating_add)
    }

    /// Consumption used for admission: the larger of this month and last month.
    pub fn recent_consumption(&self) -> u64 {
        self.cons_month.max(pow(self.months[0]))
    }

    pub fn q1_raw(&self) -> u64 {
        self.q1 as u64 * UNIT_V1
    }

    pub fn q2_raw(&self) -> u64 {
        self.q2 as u64 * UNIT_V2
    }

    pub fn qc_raw(&self) -> u64 {
        self.qc as u64 * UNIT_CONSUMPTION
    }

    pub fn can_add_notes(&self, n: u64) -> bool {
        self.v1.saturating_add(n) <= self.q1_raw()
    }

    pub fn can_add_volume(&self, bytes: u64) -> bool {
        self.v2.saturating_add(bytes) <= self.q2_raw()
    }

    pub fn flags(&self, thresholds: &QuotaThresholds) -> AdmissionFlags {
        let over = |v: u64, max: u64, pct: u32| v.saturating_mul(100) > max.saturating_mul(pct as u64);

        let (q1, q2, qc) = (self.q1_raw(), self.q2_raw(), self.qc_raw());
        let cons = self.recent_consumption();

        AdmissionFlags {
            read_only: self.v1 > q1 || self.v2 > q2,
            near_quota: over(self.v1, q1, thresholds.near_quota_pct)
                || over(self.v2, q2, thresholds.near_quota_pct),
            rate_limited: over(cons, qc, thresholds.rate_limit_pct),
            minimal_access: over(cons, qc, thresholds.minimal_access_pct),
        }
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            q1: self.q1,
            q2: self.q2,
            qc: self.qc,
            v1: self.v1,
            v2: self.v2,
            consumption: self.recent_consumption(),
        }
    }
}

/// Ages `history` by `periods`; `first` is the value of the period that just
/// closed and lands `periods - 1` slots back, or falls off the end.
fn shift_in<const N: usize>(history: &mut [u8; N], first: u8, periods: usize) {
    if periods == 0 {
        return;
    }
    if periods > N {
        *history = [0; N];
        return;
    }
    history.rotate_right(periods);
    for slot in history.iter_mut().take(periods) {
        *slot = 0;
    }
    history[periods - 1] = first;
}

fn apply_delta(v: u64, delta: i64) -> u64 {
    if delta >= 0 {
        v.saturating_add(delta as u64)
    } else {
        v.saturating_sub(delta.unsigned_abs())
    }
}

/// `(mean * day + value) / day`, kept between its two inputs.
fn running_mean(mean: u64, value: u64, day: u64) -> u64 {
    let day = day.max(1);
    let raw = mean.saturating_mul(day).saturating_add(value) / day;
    raw.clamp(mean.min(value), mean.max(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, dd: u32) -> Day {
        NaiveDate::from_ymd_opt(y, m, dd).unwrap()
    }

    #[test]
    fn log_is_monotonic() {
        let mut prev = 0u8;
        for v in [0u64, 1, 2, 3, 10, 99, 100, 1_000, 65_536, 10_000_000, u64::MAX / 4] {
            let l = log(v);
            assert!(l >= prev, "log({}) = {} < {}", v, l, prev);
            prev = l;
        }
        assert_eq!(pow(log(0)), 0);
        assert_eq!(pow(log(1)), 1);
    }

    #[test]
    fn pow_log_is_approximate() {
        // half a step of the scale, plus integer rounding at the low end
        let tolerance = LOG_BASE.sqrt() + 0.01;
        for v in [100u64, 1_000, 123_456, 10_000_000] {
            let back = pow(log(v)) as f64;
            let ratio = back / v as f64;
            assert!(
                ratio >= 1.0 / tolerance && ratio <= tolerance,
                "{} -> {}",
                v,
                back
            );
        }
    }

    #[test]
    fn monthly_mean_on_day_twelve() {
        let mut c = Counters::with_quotas(1, 1, 1);
        c.stamp = Some(d(2026, 5, 3));
        c.v1 = 100;
        c.v1m = 100;
        c.add_v1(50, d(2026, 5, 12));
        assert_eq!(c.v1, 150);
        assert_eq!(c.v1m, 112);
        // quota compares raw values
        assert!(c.v1 <= c.q1 as u64 * UNIT_V1);
    }

    #[test]
    fn month_rollover_pushes_history() {
        let mut c = Counters::with_quotas(1, 1, 1);
        c.roll(d(2026, 1, 10));
        c.record_consumption(1_000, d(2026, 1, 20));
        c.record_consumption(500, d(2026, 3, 2));
        assert_eq!(c.cons_month, 500);
        assert_eq!(c.months[0], 0);
        assert_eq!(c.months[1], log(1_000));
    }

    #[test]
    fn long_idle_gap_clears_histories() {
        let mut c = Counters::default();
        c.record_consumption(5_000, d(2024, 1, 10));
        c.record_transfer(7_000, d(2024, 1, 10));
        c.roll(d(2025, 9, 1));
        assert_eq!(c.months, [0; HISTORY_MONTHS]);
        assert_eq!(c.transfers, [0; HISTORY_DAYS]);
        assert_eq!(c.recent_consumption(), 0);
        assert_eq!(c.transfers_7d(), 0);
    }

    #[test]
    fn full_history_gap_keeps_oldest_slot() {
        let mut c = Counters::default();
        c.record_consumption(5_000, d(2025, 1, 10));
        c.roll(d(2026, 1, 3));
        assert_eq!(c.months[HISTORY_MONTHS - 1], log(5_000));
        assert!(c.months[..HISTORY_MONTHS - 1].iter().all(|l| *l == 0));
    }

    #[test]
    fn transfers_cover_seven_days() {
        let mut c = Counters::default();
        c.record_transfer(1_000, d(2026, 1, 1));
        c.record_transfer(2_000, d(2026, 1, 2));
        let total = c.transfers_7d();
        assert!(total >= 2_900 && total <= 3_100, "{}", total);
        c.roll(d(2026, 1, 20));
        assert_eq!(c.transfers_7d(), 0);
    }

    #[test]
    fn flags_follow_raw_quotas() {
        let thresholds = QuotaThresholds::default();
        let mut c = Counters::with_quotas(1, 1, 1);
        assert!(c.flags(&thresholds).is_clear());

        c.v1 = UNIT_V1 - 1;
        assert!(c.flags(&thresholds).near_quota);
        assert!(!c.flags(&thresholds).read_only);

        c.v1 = UNIT_V1 + 1;
        assert!(c.flags(&thresholds).read_only);

        c.cons_month = UNIT_CONSUMPTION * 3;
        let flags = c.flags(&thresholds);
        assert!(flags.rate_limited && flags.minimal_access);
    }
}
