//! Configures and creates tasks owned by a [`TaskSystem`].
//!
//! [`TaskSystem::task`] returns a [`TaskBuilder`]; pick a scheduler and a
//! token, then finish with a body or as a manual task.
//!
//! [`TaskSystem`]: crate::runtime::TaskSystem
//! [`TaskSystem::task`]: crate::runtime::TaskSystem::task
use crate::cancel::CancellationToken;
use crate::runtime::ActiveTasks;
use crate::scheduler::Scheduler;
use crate::task::{Payload, Task, TaskContext, boxed_body};
use std::sync::Arc;

/// Builder for a single task.
///
/// Defaults to the [`Immediate`](crate::scheduler::Immediate) strategy and a
/// token that can never be cancelled.
#[derive(Debug)]
#[must_use = "a TaskBuilder does nothing until a body or `manual` is chosen"]
pub struct TaskBuilder {
    registry: Arc<ActiveTasks>,
    scheduler: Scheduler,
    token: CancellationToken,
}

impl TaskBuilder {
    pub(crate) fn new(registry: Arc<ActiveTasks>) -> Self {
        Self {
            registry,
            scheduler: Scheduler::immediate(),
            token: CancellationToken::none(),
        }
    }

    /// Runs the task, and by default its continuations, on `scheduler`.
    pub fn on(mut self, scheduler: &Scheduler) -> Self {
        self.scheduler = scheduler.clone();
        self
    }

    /// Binds the task, and its continuations, to `token`.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Creates an unstarted task running `f`.
    pub fn body<T, F>(self, f: F) -> Task<T>
    where
        T: Payload,
        F: FnOnce(&TaskContext<'_, T>) -> anyhow::Result<T> + Send + 'static,
    {
        Task::new(
            &self.registry,
            self.scheduler,
            self.token,
            Some(boxed_body(f)),
        )
    }

    /// Creates an unstarted task running `f`, which may report progress of
    /// type `P`.
    pub fn body_with_progress<T, P, F>(self, f: F) -> Task<T, P>
    where
        T: Payload,
        P: Payload,
        F: FnOnce(&TaskContext<'_, T, P>) -> anyhow::Result<T> + Send + 'static,
    {
        Task::new(
            &self.registry,
            self.scheduler,
            self.token,
            Some(boxed_body(f)),
        )
    }

    /// Creates a task without a body, completed from the outside through
    /// [`Task::set_result`] or [`Task::set_failure`].
    pub fn manual<T: Payload>(self) -> Task<T> {
        Task::new(&self.registry, self.scheduler, self.token, None)
    }
}
