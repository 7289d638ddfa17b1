use crate::clock::Clock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

mod held;
pub(crate) use held::HeldScheduler;

mod spy;
pub(crate) use spy::{Call, Method, SpyScheduler};

/// A manual clock that counts how often it is read.
#[derive(Debug, Default)]
pub(crate) struct CountingClock {
    now_ms: AtomicU64,
    reads: AtomicUsize,
}

impl CountingClock {
    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Clock for CountingClock {
    fn now_ms(&self) -> u64 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.now_ms.load(Ordering::Relaxed)
    }
}
