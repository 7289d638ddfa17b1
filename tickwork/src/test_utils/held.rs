use crate::scheduler::{Action, Schedule};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

/// Keeps every scheduled action until the test releases it, so tests can
/// interleave registration and completion deterministically.
#[derive(Default)]
pub(crate) struct HeldScheduler {
    held: Mutex<VecDeque<Action>>,
}

impl HeldScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Runs the oldest held action. Returns `false` if none was held.
    pub(crate) fn run_one(&self) -> bool {
        let next = self.held.lock().pop_front();
        match next {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Runs held actions, including ones scheduled while running, until none
    /// are left. Returns how many ran.
    pub(crate) fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Schedule for HeldScheduler {
    fn schedule(&self, action: Action) {
        self.held.lock().push_back(action);
    }
}

impl fmt::Debug for HeldScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldScheduler")
            .field("held", &self.len())
            .finish()
    }
}
