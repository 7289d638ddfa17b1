use crate::task::{Id, State};
use crate::utils::panic_message;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Misuse of the task or scheduling API, reported synchronously to the caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task has no body to run")]
    MissingBody,

    #[error("task {id} cannot be scheduled from state {state:?}")]
    NotSchedulable { id: Id, state: State },

    #[error("task {id} is a continuation and runs when its parent finishes")]
    Continuation { id: Id },

    #[error("delay of {delay_ms}ms exceeds the maximum of {max_ms}ms")]
    InvalidDelay { delay_ms: u64, max_ms: u64 },

    #[error("task {id}: invalid transition to {attempted:?}, actual state is {actual:?}")]
    InvalidTransition {
        id: Id,
        attempted: State,
        actual: State,
    },

    #[error("a cancellation deadline needs a source created with a clock")]
    MissingClock,
}

/// The error a task faulted with.
///
/// Bodies fail with any `anyhow::Error`; the failure is shared by every
/// failure continuation and by [`Task::failure`](crate::task::Task::failure),
/// so it is reference counted and cheap to clone.
#[derive(Clone)]
pub struct TaskFailure(Arc<anyhow::Error>);

impl TaskFailure {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(error)))
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::msg(format!(
            "task body panicked: {}",
            panic_message(payload.as_ref())
        ))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if both values share the same underlying error.
    pub fn ptr_eq(&self, other: &TaskFailure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl From<TaskError> for TaskFailure {
    fn from(error: TaskError) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskFailure").field(&self.0).finish()
    }
}

impl std::error::Error for TaskFailure {}
