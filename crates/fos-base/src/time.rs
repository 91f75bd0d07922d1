//! Monotonic Time
//!
//! `TimePoint` and `TimeDelta` measured in nanoseconds on a process-wide
//! monotonic clock. Arithmetic saturates, so `TimePoint::max()` and
//! `TimeDelta::max()` act as "never" / "unbounded" sentinels.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Origin of the process clock. Fixed on first use.
fn clock_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Signed span of time in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta(i64);

impl TimeDelta {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn min() -> Self {
        Self(i64::MIN)
    }

    /// Unbounded delta
    pub const fn max() -> Self {
        Self(i64::MAX)
    }

    pub const fn from_nanoseconds(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn from_microseconds(micros: i64) -> Self {
        Self(micros.saturating_mul(NANOS_PER_MICRO))
    }

    pub const fn from_milliseconds(millis: i64) -> Self {
        Self(millis.saturating_mul(NANOS_PER_MILLI))
    }

    pub const fn from_seconds(seconds: i64) -> Self {
        Self(seconds.saturating_mul(NANOS_PER_SECOND))
    }

    /// Fractional milliseconds, truncated to whole nanoseconds
    pub fn from_milliseconds_f64(millis: f64) -> Self {
        let nanos = millis * NANOS_PER_MILLI as f64;
        if nanos >= i64::MAX as f64 {
            Self::max()
        } else if nanos <= i64::MIN as f64 {
            Self::min()
        } else {
            Self(nanos as i64)
        }
    }

    pub const fn to_nanoseconds(self) -> i64 {
        self.0
    }

    pub const fn to_microseconds(self) -> i64 {
        self.0 / NANOS_PER_MICRO
    }

    pub const fn to_milliseconds(self) -> i64 {
        self.0 / NANOS_PER_MILLI
    }

    pub fn to_milliseconds_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_MILLI as f64
    }

    pub fn to_seconds_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SECOND as f64
    }

    pub const fn is_max(self) -> bool {
        self.0 == i64::MAX
    }

    /// Negative deltas clamp to zero
    pub fn to_duration(self) -> Duration {
        if self.0 <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.0 as u64)
        }
    }
}

impl From<Duration> for TimeDelta {
    fn from(duration: Duration) -> Self {
        Self(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.0.saturating_add(rhs.0))
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;

    fn neg(self) -> TimeDelta {
        TimeDelta(self.0.saturating_neg())
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "max")
        } else {
            write!(f, "{:.3}ms", self.to_milliseconds_f64())
        }
    }
}

/// Instant on the process monotonic clock, in nanoseconds since the clock epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(i64);

impl TimePoint {
    /// Current time. Non-decreasing across calls.
    pub fn now() -> Self {
        let elapsed = clock_epoch().elapsed();
        Self(i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
    }

    pub const fn min() -> Self {
        Self(i64::MIN)
    }

    /// A point that is never reached
    pub const fn max() -> Self {
        Self(i64::MAX)
    }

    pub const fn from_epoch_delta(delta: TimeDelta) -> Self {
        Self(delta.to_nanoseconds())
    }

    pub const fn to_epoch_delta(self) -> TimeDelta {
        TimeDelta::from_nanoseconds(self.0)
    }

    pub const fn is_max(self) -> bool {
        self.0 == i64::MAX
    }

    /// Time left until this point, zero if it has already passed
    pub fn saturating_duration_since_now(self) -> Duration {
        (self - TimePoint::now()).to_duration()
    }
}

impl Add<TimeDelta> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: TimeDelta) -> TimePoint {
        TimePoint(self.0.saturating_add(rhs.to_nanoseconds()))
    }
}

impl Sub<TimeDelta> for TimePoint {
    type Output = TimePoint;

    fn sub(self, rhs: TimeDelta) -> TimePoint {
        TimePoint(self.0.saturating_sub(rhs.to_nanoseconds()))
    }
}

impl Sub for TimePoint {
    type Output = TimeDelta;

    fn sub(self, rhs: TimePoint) -> TimeDelta {
        TimeDelta::from_nanoseconds(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign<TimeDelta> for TimePoint {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "TimePoint(max)")
        } else {
            write!(f, "TimePoint({}ns)", self.0)
        }
    }
}
