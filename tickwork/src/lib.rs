//! Host-pumped tasks with continuations, cooperative cancellation and
//! pluggable execution strategies.
//!
//! A [`TaskSystem`] owns three budgeted queues which the host drains once per
//! tick ([`Phase::PreTick`], [`Phase::Tick`], [`Phase::PostTick`]), a
//! background worker pool, and a registry of delayed actions released while
//! draining the delay phase.
pub mod cancel;
pub use cancel::{CancellationToken, CancellationTokenSource};

pub mod clock;
pub use clock::{Clock, ManualClock, MonotonicClock};

pub mod runtime;
pub use runtime::{Builder, DrainReport, Phase, TaskBuilder, TaskSystem};

pub mod scheduler;
pub use scheduler::{Schedule, Scheduler};

pub mod task;
pub use task::{State, Task, TaskContext, TaskError, TaskFailure};

mod utils;

#[cfg(test)]
mod test_utils;
