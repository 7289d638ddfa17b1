use crate::task::{Payload, Task};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A reaction to a parent task's terminal state, fed with the parent's
/// result or failure.
pub(crate) trait Continuation<I>: Send + Sync {
    /// Hands `input` to the continuation and tries to run it. Returns `false`
    /// if it had already fired or could no longer be run.
    fn fire(&self, input: &I) -> bool;

    /// Settles a continuation whose trigger can no longer happen. It will
    /// never run.
    fn discard(&self);
}

// Most tasks carry zero or one continuation per outcome.
pub(crate) type ContinuationQueue<I> = SmallVec<[Arc<dyn Continuation<I>>; 2]>;

/// Connects a parent's outcome to a child task whose body consumes it.
///
/// The same link may be settled both by the parent's teardown and by the
/// registering thread re-checking the parent's state; only the first call
/// does anything.
pub(crate) struct Link<I, U> {
    input: Arc<Mutex<Option<I>>>,
    child: Task<U>,
    fired: AtomicBool,
}

impl<I, U> Link<I, U> {
    pub(crate) fn new(input: Arc<Mutex<Option<I>>>, child: Task<U>) -> Self {
        Self {
            input,
            child,
            fired: AtomicBool::new(false),
        }
    }
}

impl<I, U> Continuation<I> for Link<I, U>
where
    I: Clone + Send + 'static,
    U: Payload,
{
    fn fire(&self, input: &I) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        *self.input.lock() = Some(input.clone());
        self.child.dispatch().is_ok()
    }

    fn discard(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.child.cancel();
        }
    }
}
