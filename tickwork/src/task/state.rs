use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task.
///
/// `Created -> WaitingToRun -> Running -> {RanToCompletion | Faulted}`, with
/// `Cancelled` reachable from anywhere. Tasks without a body skip straight
/// from `Created` to a terminal state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Created = 0,
    WaitingToRun = 1,
    Running = 2,
    RanToCompletion = 3,
    Faulted = 4,
    Cancelled = 5,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::RanToCompletion | State::Faulted | State::Cancelled
        )
    }

    /// The state a task must be in to move to `self`.
    ///
    /// `None` for `Created`, which is never a target, and for `Cancelled`,
    /// which is entered from any state.
    pub fn required_prior(self, has_body: bool) -> Option<State> {
        match self {
            State::Created | State::Cancelled => None,
            State::WaitingToRun => Some(State::Created),
            State::Running => Some(State::WaitingToRun),
            State::RanToCompletion | State::Faulted if has_body => Some(State::Running),
            State::RanToCompletion | State::Faulted => Some(State::Created),
        }
    }

    /// Human readable description, distinct for tasks with and without a
    /// body.
    pub fn describe(self, has_body: bool) -> &'static str {
        match (self, has_body) {
            (State::Created, true) => "created, waiting to be scheduled",
            (State::Created, false) => "created, waiting for a result to be set",
            (State::WaitingToRun, true) => "scheduled, waiting to run",
            (State::WaitingToRun, false) => "invalid state: waiting to run without a body",
            (State::Running, true) => "running",
            (State::Running, false) => "invalid state: running without a body",
            (State::RanToCompletion, true) => "ran to completion",
            (State::RanToCompletion, false) => "completed with a result set externally",
            (State::Faulted, true) => "faulted while running",
            (State::Faulted, false) => "faulted with an error set externally",
            (State::Cancelled, true) => "cancelled",
            (State::Cancelled, false) => "cancelled before a result was set",
        }
    }

    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Created,
            1 => State::WaitingToRun,
            2 => State::Running,
            3 => State::RanToCompletion,
            4 => State::Faulted,
            _ => State::Cancelled,
        }
    }
}

/// Atomic cell holding a [`State`], advanced by compare-and-swap.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(State::Created as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if the current state is the one required for it.
    ///
    /// Returns the prior state on success and the actual state on failure.
    /// `Cancelled` bypasses the table and always succeeds.
    pub(crate) fn transition(&self, next: State, has_body: bool) -> Result<State, State> {
        match next.required_prior(has_body) {
            Some(prior) => self.compare_exchange(prior, next),
            None if next == State::Cancelled => {
                Ok(State::from_u8(self.0.swap(next as u8, Ordering::AcqRel)))
            }
            None => Err(self.load()),
        }
    }

    pub(crate) fn compare_exchange(&self, current: State, next: State) -> Result<State, State> {
        self.0
            .compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(State::from_u8)
            .map_err(State::from_u8)
    }
}
