use std::ops::{Add, Sub};

use crate::Duration;

/// Point on the process-wide monotonic clock (quanta, TSC-backed where
/// available). All pacing and timeouts in the transfer engine run off this,
/// never off wall-clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(quanta::Instant);

impl Instant {
    #[inline]
    pub fn now() -> Self {
        Instant(quanta::Instant::now())
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        Instant::now() - *self
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        Duration(self.0.saturating_duration_since(other.0).as_nanos() as u64)
    }
}

impl Sub for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_sub(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + std::time::Duration::from(rhs))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0 - std::time::Duration::from(rhs))
    }
}
