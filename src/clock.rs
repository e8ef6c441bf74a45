//! Wall-clock sources.
//!
//! Windows, blocks, breaker cooldowns and penalty decay are all measured
//! against a [`Clock`] so that tests can move time explicitly.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at a fixed, arbitrary epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += delta(by);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a std duration into a chrono delta.
///
/// Policy durations are validated to at most 30 days, so millisecond
/// precision never overflows here.
pub fn delta(d: Duration) -> TimeDelta {
    TimeDelta::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// `at + d`, clamped to the latest representable instant.
pub fn saturating_add(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta(d)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, clamped to the earliest representable instant.
pub fn saturating_sub(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(delta(d)).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Whole seconds from `now` until `at`, rounded up and never negative.
pub fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (at - now).num_milliseconds();
    if ms <= 0 {
        0
    } else {
        ((ms + 999) / 1000) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch();
        let start = clock.now();

        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }

    #[test]
    fn test_seconds_until_rounds_up() {
        let now = ManualClock::at_epoch().now();

        assert_eq!(seconds_until(now + TimeDelta::milliseconds(1), now), 1);
        assert_eq!(seconds_until(now + TimeDelta::seconds(289), now), 289);
        assert_eq!(seconds_until(now - TimeDelta::seconds(5), now), 0);
    }

    #[test]
    fn test_saturating_arithmetic_clamps() {
        let now = ManualClock::at_epoch().now();
        let huge = Duration::from_secs(10_000_000_000_000);

        assert_eq!(saturating_sub(now, huge), DateTime::<Utc>::MIN_UTC);
        assert_eq!(saturating_add(now, huge), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            saturating_add(now, Duration::from_secs(30)),
            now + TimeDelta::seconds(30)
        );
    }
}
