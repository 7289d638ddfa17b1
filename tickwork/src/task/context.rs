use crate::cancel::CancellationToken;
use crate::task::{Id, Payload, State, TaskInner};

/// Handed to a task body while it runs.
///
/// Gives the body its identity, its cancellation token for cooperative
/// checks, and a way to report progress to registered handlers.
pub struct TaskContext<'a, T, P = ()> {
    task: &'a TaskInner<T, P>,
}

impl<'a, T: Payload, P: Payload> TaskContext<'a, T, P> {
    pub(crate) fn new(task: &'a TaskInner<T, P>) -> Self {
        Self { task }
    }

    pub fn id(&self) -> Id {
        self.task.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.task.token
    }

    /// Cooperative cancellation check for long running bodies. Returning
    /// early is up to the body.
    pub fn is_cancellation_requested(&self) -> bool {
        self.task.token.is_cancellation_requested()
    }

    /// Publishes `progress` to every handler registered on the task.
    ///
    /// Each handler gets its own action on its own scheduler. Returns `false`
    /// and drops the value if the task is no longer running, including when
    /// its token has fired.
    pub fn report_progress(&self, progress: P) -> bool {
        // Observes a fired token, which cancels the task.
        if self.task.state() != State::Running {
            return false;
        }

        let handlers = {
            let mut slot = self.task.progress.lock();
            slot.last = Some(progress.clone());
            slot.handlers.clone()
        };

        tracing::trace!(id = %self.task.id, handlers = handlers.len(), "progress reported");

        for (handler, scheduler) in handlers {
            let progress = progress.clone();
            scheduler.schedule(Box::new(move || handler(progress)));
        }

        true
    }
}
