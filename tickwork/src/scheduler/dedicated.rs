use crate::runtime::ThreadNameFn;
use crate::scheduler::{Action, Schedule, run_contained};
use std::thread;

/// Spawns a fresh, named thread for every scheduled action.
///
/// Thread creation is expensive compared to the other strategies; this is for
/// long-lived work that would otherwise hog a pool worker or the pump.
#[derive(Debug, Clone)]
pub struct DedicatedThread {
    thread_name: ThreadNameFn,
    stack_size: Option<usize>,
}

impl DedicatedThread {
    pub(crate) fn new(thread_name: ThreadNameFn, stack_size: Option<usize>) -> Self {
        Self {
            thread_name,
            stack_size,
        }
    }
}

impl Schedule for DedicatedThread {
    fn schedule(&self, action: Action) {
        let mut builder = thread::Builder::new().name(self.thread_name.next_name());

        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        // The thread is detached: completion is observed through the task,
        // never by joining.
        if let Err(e) = builder.spawn(move || {
            run_contained(action, "dedicated-thread");
        }) {
            tracing::error!(error = %e, "failed to spawn dedicated thread, action dropped");
        }
    }
}
