use crate::task::{Id, State};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Type-erased view of a task, as seen by the registry.
pub(crate) trait TaskEntry: Send + Sync {
    fn id(&self) -> Id;

    /// Current state, observing cancellation like [`Task::state`].
    ///
    /// [`Task::state`]: crate::task::Task::state
    fn state(&self) -> State;

    fn has_body(&self) -> bool;

    fn cancel(&self);
}

/// Point-in-time view of one unfinished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: Id,
    pub state: State,
    pub has_body: bool,
}

// Every unfinished task created by one task system, keyed by id so snapshots
// come out in creation order.
//
// The registry only holds weak references: it must never keep a task alive.
// Tasks leave it when they finish, and when their last handle is dropped.
// The lock is only held to insert, remove or copy out entries; task methods
// are never called under it since they may remove themselves.
#[derive(Default)]
pub struct ActiveTasks {
    tasks: Mutex<BTreeMap<Id, Weak<dyn TaskEntry>>>,
}

impl ActiveTasks {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn insert(&self, id: Id, entry: Weak<dyn TaskEntry>) {
        self.tasks.lock().insert(id, entry);
    }

    /// Removes a task by its ID. Returns `false` if it was already gone.
    pub(crate) fn remove(&self, id: Id) -> bool {
        self.tasks.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Unfinished tasks in id order.
    ///
    /// Reading each state observes cancellation, so tasks whose token has
    /// fired are cancelled and left out.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.live()
            .into_iter()
            .filter_map(|entry| {
                let state = entry.state();
                (!state.is_terminal()).then(|| TaskSnapshot {
                    id: entry.id(),
                    state,
                    has_body: entry.has_body(),
                })
            })
            .collect()
    }

    /// Cancels every unfinished task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;

        for entry in self.live() {
            if !entry.state().is_terminal() {
                entry.cancel();
                count += 1;
            }
        }

        tracing::debug!(count, "cancelled all active tasks");
        count
    }

    fn live(&self) -> Vec<Arc<dyn TaskEntry>> {
        self.tasks
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl fmt::Debug for ActiveTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTasks")
            .field("len", &self.len())
            .finish()
    }
}
