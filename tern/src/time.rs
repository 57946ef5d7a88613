//! Kernel time: tick-based durations, instants, and timeouts.

use crate::kernel::hal::TICK_HZ;
use crate::kernel::tick;
use core::ops::{Add, Sub};

/// A span of time in ticks.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct Duration {
    ticks: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration { ticks: 0 };
    pub const SECOND: Duration = Duration { ticks: TICK_HZ };
    pub const MILLISECOND: Duration = Duration {
        ticks: TICK_HZ / 1000,
    };

    pub const fn from_ticks(ticks: u64) -> Duration {
        Duration { ticks }
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            ticks: Duration::SECOND.ticks * secs,
        }
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration {
            ticks: Duration::MILLISECOND.ticks * millis,
        }
    }

    pub const fn as_ticks(&self) -> u64 {
        self.ticks
    }

    pub const fn as_secs(&self) -> u64 {
        self.ticks / Duration::SECOND.ticks
    }

    pub const fn as_millis(&self) -> u64 {
        self.ticks / Duration::MILLISECOND.ticks
    }

    pub const fn is_zero(&self) -> bool {
        self.ticks == 0
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl Sub<Duration> for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration {
            ticks: self.ticks - rhs.ticks,
        }
    }
}

/// A point on the kernel tick clock.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct Instant {
    pub(crate) tick: u64,
}

impl Instant {
    pub fn now() -> Instant {
        Instant {
            tick: tick::current_tick(),
        }
    }

    /// Time elapsed since this instant; zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        let now = tick::current_tick();
        Duration {
            ticks: now.saturating_sub(self.tick),
        }
    }

    pub const fn as_tick(&self) -> u64 {
        self.tick
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant {
            tick: self.tick + rhs.as_ticks(),
        }
    }
}

/// Deadline policy for blocking operations: try once, wait a bounded
/// number of ticks, or wait forever.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Timeout {
    /// Do not block; fail with `WouldBlock` instead.
    Poll,
    /// Wait at most this many ticks, then fail with `Timeout`.
    Ticks(u64),
    /// Wait until the operation completes.
    Forever,
}

impl Timeout {
    /// Absolute deadline tick, if this timeout is bounded.
    pub(crate) fn deadline(&self, now: u64) -> Option<u64> {
        match self {
            Timeout::Ticks(n) => Some(now.saturating_add(*n)),
            Timeout::Poll | Timeout::Forever => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Timeout {
        Timeout::Ticks(d.as_ticks())
    }
}
