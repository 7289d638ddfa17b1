//! Millisecond time sources.
//!
//! The core never reads a wall clock on its own. Everything that depends on
//! time (token deadlines, delayed dispatch, budgeted drains) asks a [`Clock`],
//! which the host provides when building the [`TaskSystem`].
//!
//! [`TaskSystem`]: crate::runtime::TaskSystem
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonically non-decreasing millisecond clock.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds. Successive calls never go backwards.
    fn now_ms(&self) -> u64;
}

/// Milliseconds elapsed since the clock was created, backed by [`Instant`].
///
/// This is the default clock of a [`Builder`](crate::runtime::Builder).
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Hosts that already track their own frame time can feed it through this
/// clock once per tick. It is also what the tests drive time with.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now.fetch_add(delta_ms, Ordering::AcqRel) + delta_ms
    }

    /// Sets the clock to `now_ms`. Earlier values are ignored so the clock
    /// stays monotonic.
    pub fn set(&self, now_ms: u64) {
        self.now.fetch_max(now_ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
