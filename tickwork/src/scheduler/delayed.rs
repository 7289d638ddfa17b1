use crate::clock::Clock;
use crate::scheduler::{Action, LaneId, Schedule, Scheduler, run_contained};
use crate::task::TaskError;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Longest delay accepted by [`DelayedDispatch`].
pub const MAX_DELAY_MS: u64 = u32::MAX as u64;

// Most flushes release a handful of actions at once.
const FLUSH_INLINE_CAPACITY: usize = 8;

struct DelayedAction {
    action: Action,
    target: Scheduler,
    fire_at: u64,
}

/// Pending delayed actions, sorted by fire time.
///
/// Entries with equal fire times keep their insertion order. One lock covers
/// insertion, scanning and removal; it is never held while an action runs.
#[derive(Default)]
pub struct DelayedActions {
    entries: Mutex<VecDeque<DelayedAction>>,
}

impl DelayedActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, fire_at: u64, target: Scheduler, action: Action) {
        let mut entries = self.entries.lock();

        // Linear scan for the first strictly later entry; equal fire times
        // stay behind earlier inserts.
        let at = entries
            .iter()
            .position(|e| e.fire_at > fire_at)
            .unwrap_or(entries.len());

        entries.insert(
            at,
            DelayedAction {
                action,
                target,
                fire_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fire time of the earliest pending action.
    pub fn next_due(&self) -> Option<u64> {
        self.entries.lock().front().map(|e| e.fire_at)
    }

    /// Releases every action due at `now_ms`, in fire-time order, and returns
    /// how many were released.
    ///
    /// Actions targeting the lane named by `draining` run inline on the
    /// calling thread instead of going back through that lane's queue.
    pub fn flush_due(&self, now_ms: u64, draining: Option<LaneId>) -> usize {
        let due = {
            let mut entries = self.entries.lock();
            let mut due = SmallVec::<[DelayedAction; FLUSH_INLINE_CAPACITY]>::new();

            // Sorted, so the first entry that is not due ends the scan.
            while entries.front().is_some_and(|e| e.fire_at <= now_ms) {
                if let Some(entry) = entries.pop_front() {
                    due.push(entry);
                }
            }

            due
        };

        let fired = due.len();
        for entry in due {
            match (draining, entry.target.lane()) {
                (Some(draining), Some(lane)) if draining == lane => {
                    run_contained(entry.action, "delayed-inline");
                }
                _ => entry.target.schedule(entry.action),
            }
        }

        if fired > 0 {
            tracing::trace!(fired, now_ms, "delayed actions released");
        }

        fired
    }

    /// Drops every pending action without running it.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.entries.lock());
        dropped.len()
    }
}

impl fmt::Debug for DelayedActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedActions")
            .field("pending", &self.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}

/// Defers actions by a fixed delay before handing them to `inner`.
///
/// Deferred actions wait in a shared [`DelayedActions`] registry, which the
/// pump flushes while draining the task system's delay phase.
#[derive(Debug, Clone)]
pub struct DelayedDispatch {
    inner: Scheduler,
    delay_ms: u64,
    registry: Arc<DelayedActions>,
    clock: Arc<dyn Clock>,
}

impl DelayedDispatch {
    pub fn try_new(
        inner: Scheduler,
        delay_ms: u64,
        registry: Arc<DelayedActions>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TaskError> {
        if delay_ms > MAX_DELAY_MS {
            return Err(TaskError::InvalidDelay {
                delay_ms,
                max_ms: MAX_DELAY_MS,
            });
        }

        Ok(Self {
            inner,
            delay_ms,
            registry,
            clock,
        })
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn inner(&self) -> &Scheduler {
        &self.inner
    }
}

impl Schedule for DelayedDispatch {
    fn schedule(&self, action: Action) {
        let now = self.clock.now_ms();
        let fire_at = now.saturating_add(self.delay_ms);

        // Already due: zero delay, or a clock saturated at its maximum.
        if fire_at <= now {
            self.inner.schedule(action);
        } else {
            self.registry.insert(fire_at, self.inner.clone(), action);
        }
    }
}
