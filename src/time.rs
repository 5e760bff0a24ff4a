//! Fixed-point log time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A point on a log's timeline, as whole seconds plus nanoseconds.
///
/// Values are always normalized (`nsec < 1e9`), so the derived ordering
/// on `(sec, nsec)` is the total time order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };
    pub const MAX: Time = Time {
        sec: u32::MAX,
        nsec: (NANOS_PER_SEC - 1) as u32,
    };

    /// Create a time, carrying excess nanoseconds into seconds.
    pub fn new(sec: u32, nsec: u32) -> Self {
        let carry = nsec as u64 / NANOS_PER_SEC;
        let sec = (sec as u64).saturating_add(carry);
        if sec > u32::MAX as u64 {
            return Time::MAX;
        }
        Time {
            sec: sec as u32,
            nsec: (nsec as u64 % NANOS_PER_SEC) as u32,
        }
    }

    pub fn from_nanos(nanos: u64) -> Self {
        let sec = nanos / NANOS_PER_SEC;
        if sec > u32::MAX as u64 {
            return Time::MAX;
        }
        Time {
            sec: sec as u32,
            nsec: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    pub fn as_nanos(self) -> u64 {
        self.sec as u64 * NANOS_PER_SEC + self.nsec as u64
    }

    /// Convert from floating-point seconds. Negative and NaN inputs map to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !(secs > 0.0) {
            return Time::ZERO;
        }
        let nanos = (secs * NANOS_PER_SEC as f64).round();
        if nanos >= u64::MAX as f64 {
            return Time::MAX;
        }
        Time::from_nanos(nanos as u64)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NANOS_PER_SEC as f64
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Time) -> Duration {
        Duration::from_nanos(self.as_nanos().saturating_sub(earlier.as_nanos()))
    }

    pub fn saturating_add(self, d: Duration) -> Time {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Time::from_nanos(self.as_nanos().saturating_add(nanos))
    }

    pub fn saturating_sub(self, d: Duration) -> Time {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Time::from_nanos(self.as_nanos().saturating_sub(nanos))
    }

    /// The next representable time.
    pub fn next(self) -> Time {
        self.saturating_add(Duration::from_nanos(1))
    }

    /// The previous representable time (saturating at zero).
    pub fn prev(self) -> Time {
        self.saturating_sub(Duration::from_nanos(1))
    }

    /// Position of `self` within `[start, end]` as a fraction in `0..=1`.
    pub fn fraction_of(self, start: Time, end: Time) -> f64 {
        let span = end.as_nanos().saturating_sub(start.as_nanos());
        if span == 0 {
            return 1.0;
        }
        let offset = self.as_nanos().saturating_sub(start.as_nanos()).min(span);
        offset as f64 / span as f64
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        self.saturating_add(rhs)
    }
}

impl Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, rhs: Duration) -> Time {
        self.saturating_sub(rhs)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}.{:09})", self.sec, self.nsec)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
