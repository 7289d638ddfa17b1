use crate::clock::Clock;
use crate::scheduler::{Action, LaneId, Schedule, run_contained};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const MIN_BUDGET_MS: u32 = 1;
pub const MAX_BUDGET_MS: u32 = 100;

/// Budgets outside `[MIN_BUDGET_MS, MAX_BUDGET_MS]` are clamped, never
/// rejected.
pub fn clamp_budget(budget_ms: u32) -> u32 {
    budget_ms.clamp(MIN_BUDGET_MS, MAX_BUDGET_MS)
}

/// A FIFO of actions drained by an external pump in bounded time slices.
///
/// Scheduling only enqueues. Nothing runs until the pump calls [`drain`],
/// which pops and runs actions one at a time until the queue is empty or the
/// time spent since the drain started reaches the budget. Whatever is left
/// waits for the next drain.
///
/// [`drain`]: BudgetedQueue::drain
pub struct BudgetedQueue {
    id: LaneId,

    name: &'static str,

    queue: Mutex<VecDeque<Action>>,

    budget_ms: AtomicU32,

    clock: Arc<dyn Clock>,

    draining: AtomicBool,
}

impl BudgetedQueue {
    pub fn new(name: &'static str, budget_ms: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: LaneId::next(),
            name,
            queue: Mutex::new(VecDeque::new()),
            budget_ms: AtomicU32::new(clamp_budget(budget_ms)),
            clock,
            draining: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LaneId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn budget_ms(&self) -> u32 {
        self.budget_ms.load(Ordering::Relaxed)
    }

    /// Sets the budget used by [`drain`](BudgetedQueue::drain) and returns the
    /// clamped value that was stored.
    pub fn set_budget(&self, budget_ms: u32) -> u32 {
        let budget_ms = clamp_budget(budget_ms);
        self.budget_ms.store(budget_ms, Ordering::Relaxed);
        budget_ms
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Drains with the configured budget. Returns the number of actions run.
    pub fn drain(&self) -> usize {
        self.drain_for(self.budget_ms())
    }

    /// Drains for up to `budget_ms` (clamped). Returns the number of actions
    /// run.
    ///
    /// An empty queue returns immediately without reading the clock. A drain
    /// started from inside one of this queue's own actions is refused.
    pub fn drain_for(&self, budget_ms: u32) -> usize {
        if self.is_empty() {
            return 0;
        }

        if self.draining.swap(true, Ordering::AcqRel) {
            tracing::warn!(lane = self.name, "reentrant drain refused");
            return 0;
        }
        let _guard = ScopeGuard::new(|| self.draining.store(false, Ordering::Release));

        let budget_ms = u64::from(clamp_budget(budget_ms));
        let start = self.clock.now_ms();
        let mut executed = 0;

        loop {
            // Never hold the lock while running: actions schedule more work
            // onto this very queue.
            let Some(action) = self.queue.lock().pop_front() else {
                break;
            };

            run_contained(action, self.name);
            executed += 1;

            if self.clock.now_ms().saturating_sub(start) >= budget_ms {
                break;
            }
        }

        tracing::trace!(
            lane = self.name,
            executed,
            remaining = self.len(),
            "budgeted drain finished"
        );

        executed
    }
}

impl Schedule for BudgetedQueue {
    fn schedule(&self, action: Action) {
        self.queue.lock().push_back(action);
    }

    fn lane(&self) -> Option<LaneId> {
        Some(self.id)
    }
}

impl fmt::Debug for BudgetedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetedQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("budget_ms", &self.budget_ms())
            .field("queued", &self.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}
