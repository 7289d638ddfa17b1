//! Tasks, their lifecycle and continuation chaining.
//!
//! A [`Task`] is created unstarted, handed to its [`Scheduler`] with
//! [`Task::run`], and moves through [`State`] until it finishes. Tasks
//! without a body are completed from the outside with
//! [`Task::set_result`] or [`Task::set_failure`].
//!
//! [`Scheduler`]: crate::scheduler::Scheduler
mod context;
pub use context::TaskContext;

pub(crate) mod continuation;

mod error;
pub use error::{TaskError, TaskFailure};

mod id;
pub use id::Id;

mod state;
pub use state::State;

mod task;
pub(crate) use task::{TaskInner, boxed_body};
pub use task::Task;

#[cfg(test)]
mod tests;

/// Values a task can produce or report as progress.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}
