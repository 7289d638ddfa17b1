use crate::scheduler::{Action, Schedule};

/// Runs every action synchronously on the thread that schedules it.
///
/// Whatever triggered the schedule (a `run` call, a completing parent task)
/// is blocked until the action returns, so keep it to short work. A panic in
/// the action unwinds into the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl Schedule for Immediate {
    fn schedule(&self, action: Action) {
        action();
    }
}
