//! Clock port - 時刻の抽象化
//!
//! - [`SystemClock`]（本番用）、[`FixedClock`]（テスト用）
//! - [`MonotonicStamp`]: ノード内でタイムスタンプを狭義単調増加にする

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Clock は現在時刻を提供
///
/// # テスト容易性
/// - trait により時刻を差し替え可能
/// - テストでは FixedClock を使用
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    at: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Hands out strictly increasing epoch-millis stamps for one node.
///
/// If the clock did not move (or moved backwards) since the previous stamp,
/// the previous stamp + 1 is returned instead.
#[derive(Debug)]
pub struct MonotonicStamp {
    last: AtomicI64,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub fn next(&self, clock: &dyn Clock) -> i64 {
        let now = clock.now_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now > prev { now } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for MonotonicStamp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_is_fixed() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::new(at);
        assert_eq!(clock.now(), at);
        assert_eq!(clock.now_millis(), at.timestamp_millis());
    }

    #[test]
    fn stamps_strictly_increase_on_a_stalled_clock() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::new(at);
        let stamp = MonotonicStamp::new();

        let a = stamp.next(&clock);
        let b = stamp.next(&clock);
        let c = stamp.next(&clock);
        assert_eq!(a, at.timestamp_millis());
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn default_stamp_starts_like_new() {
        let at = Utc.with_ymd_and_hms(1969, 7, 20, 20, 17, 0).unwrap();
        let clock = FixedClock::new(at);
        assert_eq!(MonotonicStamp::default().next(&clock), at.timestamp_millis());
        assert_eq!(MonotonicStamp::new().next(&clock), at.timestamp_millis());
    }

    #[test]
    fn stamps_follow_a_moving_clock() {
        let stamp = MonotonicStamp::new();
        let a = stamp.next(&SystemClock);
        std::thread::sleep(std::time::Duration::from_millis(3));
        let b = stamp.next(&SystemClock);
        assert!(b > a);
    }
}
