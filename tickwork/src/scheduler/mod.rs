//! Execution strategies.
//!
//! Every strategy accepts a zero-argument [`Action`] and decides when and on
//! which thread it runs. Tasks only ever talk to the [`Scheduler`] handle, so
//! strategies can be swapped freely.
use crate::utils::panic_message;
use std::fmt;
use std::num::NonZeroU64;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

mod budgeted;
pub use budgeted::{BudgetedQueue, MAX_BUDGET_MS, MIN_BUDGET_MS, clamp_budget};

mod dedicated;
pub use dedicated::DedicatedThread;

pub(crate) mod delayed;
pub use delayed::{DelayedActions, DelayedDispatch, MAX_DELAY_MS};

mod immediate;
pub use immediate::Immediate;

mod pool;
pub use pool::{BackgroundPool, WorkerPool};

/// A unit of work handed to a scheduler.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler trait
pub trait Schedule: Send + Sync + fmt::Debug {
    /// Accept `action` for execution. When and where it runs is up to the
    /// strategy.
    fn schedule(&self, action: Action);

    /// Budgeted queues identify themselves so delayed actions targeting the
    /// queue currently being drained can run inline.
    fn lane(&self) -> Option<LaneId> {
        None
    }
}

/// Identifies one budgeted queue across every task system in the process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct LaneId(NonZeroU64);

impl LaneId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique lane ID: bitspace exhausted")
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

static IMMEDIATE: LazyLock<Scheduler> = LazyLock::new(|| Scheduler::new(Immediate));

/// Shared handle to a scheduling strategy.
#[derive(Clone)]
pub struct Scheduler(Arc<dyn Schedule>);

impl Scheduler {
    pub fn new<S: Schedule + 'static>(strategy: S) -> Self {
        Self(Arc::new(strategy))
    }

    pub fn from_arc(strategy: Arc<dyn Schedule>) -> Self {
        Self(strategy)
    }

    /// The process-wide [`Immediate`] strategy.
    pub fn immediate() -> Self {
        IMMEDIATE.clone()
    }

    /// Returns `true` if both handles point at the same strategy instance.
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::immediate()
    }
}

impl Deref for Scheduler {
    type Target = dyn Schedule;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scheduler").field(&self.0).finish()
    }
}

impl<S: Schedule + 'static> From<Arc<S>> for Scheduler {
    fn from(strategy: Arc<S>) -> Self {
        Self(strategy)
    }
}

/// Runs `action`, containing any panic so the calling worker or pump
/// survives. Returns `false` if the action panicked.
pub(crate) fn run_contained(action: Action, origin: &'static str) -> bool {
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(
                origin,
                panic = %panic_message(payload.as_ref()),
                "scheduled action panicked"
            );
            false
        }
    }
}
