use crate::cancel::CancellationToken;
use crate::runtime::{ActiveTasks, TaskEntry};
use crate::scheduler::Scheduler;
use crate::task::continuation::{Continuation, ContinuationQueue, Link};
use crate::task::state::AtomicState;
use crate::task::{Id, Payload, State, TaskContext, TaskError, TaskFailure};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

/// Work run by a task, given access to its [`TaskContext`].
pub(crate) type Body<T, P> =
    Box<dyn FnOnce(&TaskContext<'_, T, P>) -> anyhow::Result<T> + Send + 'static>;

pub(crate) fn boxed_body<T, P, F>(f: F) -> Body<T, P>
where
    F: FnOnce(&TaskContext<'_, T, P>) -> anyhow::Result<T> + Send + 'static,
{
    Box::new(f)
}

pub(crate) type ProgressHandler<P> = Arc<dyn Fn(P) + Send + Sync + 'static>;

pub(crate) struct ProgressSlot<P> {
    pub(crate) last: Option<P>,
    pub(crate) handlers: Vec<(ProgressHandler<P>, Scheduler)>,
}

impl<P> Default for ProgressSlot<P> {
    fn default() -> Self {
        Self {
            last: None,
            handlers: Vec::new(),
        }
    }
}

// Exactly one of the two is set, and only in the matching terminal state.
struct Outcome<T> {
    result: Option<T>,
    failure: Option<TaskFailure>,
}

pub(crate) struct TaskInner<T, P> {
    pub(crate) id: Id,

    pub(crate) state: AtomicState,

    has_body: bool,

    // Continuation children only run when their parent settles them.
    continuation: bool,

    body: Mutex<Option<Body<T, P>>>,

    scheduler: Scheduler,

    pub(crate) token: CancellationToken,

    /// Every terminal transition happens while holding this lock, so the
    /// outcome is never observed half written.
    outcome: Mutex<Outcome<T>>,

    on_success: Mutex<ContinuationQueue<T>>,

    on_failure: Mutex<ContinuationQueue<TaskFailure>>,

    pub(crate) progress: Mutex<ProgressSlot<P>>,

    registry: Arc<ActiveTasks>,
}

impl<T: Payload, P: Payload> TaskInner<T, P> {
    /// Current state, cancelling first if the token has fired. Once the token
    /// fires no reader sees anything but Cancelled, finished tasks included.
    pub(crate) fn state(&self) -> State {
        let state = self.state.load();

        if state != State::Cancelled && self.token.is_cancellation_requested() {
            self.cancel();
            return self.state.load();
        }

        state
    }

    fn cancel(&self) {
        let prior = {
            let mut outcome = self.outcome.lock();
            let prior = match self.state.transition(State::Cancelled, self.has_body) {
                Ok(prior) | Err(prior) => prior,
            };
            outcome.result = None;
            outcome.failure = None;
            prior
        };

        if prior == State::Cancelled {
            return;
        }

        tracing::trace!(id = %self.id, ?prior, "task cancelled");

        let (successes, failures) = self.teardown();
        successes.iter().for_each(|c| c.discard());
        failures.iter().for_each(|c| c.discard());
    }

    /// Moves to the terminal state matching `outcome` and fires the matching
    /// continuations. Returns `false` if the task had already finished.
    fn finish(&self, outcome: Result<T, TaskFailure>) -> bool {
        let next = match outcome {
            Ok(_) => State::RanToCompletion,
            Err(_) => State::Faulted,
        };

        let mut slot = self.outcome.lock();
        if let Err(actual) = self.state.transition(next, self.has_body) {
            drop(slot);

            if !actual.is_terminal() {
                self.force_fault(next, actual);
            }
            return false;
        }

        match outcome {
            Ok(value) => {
                slot.result = Some(value.clone());
                drop(slot);

                tracing::trace!(id = %self.id, "task ran to completion");

                let (successes, failures) = self.teardown();
                failures.iter().for_each(|c| c.discard());
                for continuation in successes {
                    continuation.fire(&value);
                }
            }
            Err(failure) => {
                slot.failure = Some(failure.clone());
                drop(slot);

                tracing::trace!(id = %self.id, %failure, "task faulted");

                self.fire_failure(failure);
            }
        }

        true
    }

    /// Safety net for transitions that do not match the state table: the
    /// task is faulted with a diagnostic naming both states.
    fn force_fault(&self, attempted: State, actual: State) {
        let failure = TaskFailure::from(TaskError::InvalidTransition {
            id: self.id,
            attempted,
            actual,
        });

        {
            let mut slot = self.outcome.lock();
            let mut current = self.state.load();

            loop {
                if current.is_terminal() {
                    return;
                }

                match self.state.compare_exchange(current, State::Faulted) {
                    Ok(_) => break,
                    Err(now) => current = now,
                }
            }

            slot.result = None;
            slot.failure = Some(failure.clone());
        }

        tracing::warn!(
            id = %self.id,
            ?attempted,
            ?actual,
            "invalid task transition, forcing task to faulted"
        );

        self.fire_failure(failure);
    }

    fn fire_failure(&self, failure: TaskFailure) {
        let (successes, failures) = self.teardown();
        successes.iter().for_each(|c| c.discard());
        for continuation in failures {
            continuation.fire(&failure);
        }
    }

    /// Runs once per task, right after it turns terminal. Queues are handed
    /// back so continuations are fired or discarded with no lock held.
    fn teardown(&self) -> (ContinuationQueue<T>, ContinuationQueue<TaskFailure>) {
        let successes = mem::take(&mut *self.on_success.lock());
        let failures = mem::take(&mut *self.on_failure.lock());
        let handlers = mem::take(&mut self.progress.lock().handlers);
        let body = self.body.lock().take();

        self.registry.remove(self.id);

        drop(handlers);
        drop(body);

        (successes, failures)
    }

    /// Queues `link` to fire when the task reaches `trigger`, or settles it
    /// right away if the task is already finished.
    fn attach<I>(
        &self,
        queue: &Mutex<ContinuationQueue<I>>,
        link: Arc<dyn Continuation<I>>,
        trigger: State,
        input: impl Fn(&Self) -> Option<I>,
    ) {
        if !self.state().is_terminal() {
            let mut pending = queue.lock();
            if !self.state.load().is_terminal() {
                pending.push(link.clone());
            }
        }

        // Look again: the task may have finished while the link was being
        // queued, in which case teardown might have missed it. Firing twice
        // is harmless.
        let state = self.state.load();
        if state == trigger {
            match input(self) {
                Some(value) => {
                    link.fire(&value);
                }
                None => link.discard(),
            }
        } else if state.is_terminal() {
            link.discard();
        }
    }
}

impl<T, P> Drop for TaskInner<T, P> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl<T: Payload, P: Payload> TaskEntry for TaskInner<T, P> {
    fn id(&self) -> Id {
        self.id
    }

    fn state(&self) -> State {
        TaskInner::state(self)
    }

    fn has_body(&self) -> bool {
        self.has_body
    }

    fn cancel(&self) {
        TaskInner::cancel(self)
    }
}

/// A unit of work with an observable lifecycle.
///
/// `T` is the result type and `P` the progress type; both default to `()`.
/// Handles are cheap to clone and all clones refer to the same task.
pub struct Task<T = (), P = ()> {
    inner: Arc<TaskInner<T, P>>,
}

impl<T, P> Clone for Task<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Payload, P: Payload> Task<T, P> {
    pub(crate) fn new(
        registry: &Arc<ActiveTasks>,
        scheduler: Scheduler,
        token: CancellationToken,
        body: Option<Body<T, P>>,
    ) -> Self {
        Self::build(registry, scheduler, token, body, false)
    }

    fn build(
        registry: &Arc<ActiveTasks>,
        scheduler: Scheduler,
        token: CancellationToken,
        body: Option<Body<T, P>>,
        continuation: bool,
    ) -> Self {
        let id = Id::next();
        let inner = Arc::new(TaskInner {
            id,
            state: AtomicState::new(),
            has_body: body.is_some(),
            continuation,
            body: Mutex::new(body),
            scheduler,
            token,
            outcome: Mutex::new(Outcome {
                result: None,
                failure: None,
            }),
            on_success: Mutex::new(ContinuationQueue::new()),
            on_failure: Mutex::new(ContinuationQueue::new()),
            progress: Mutex::new(ProgressSlot::default()),
            registry: registry.clone(),
        });

        let entry: Weak<dyn TaskEntry> = Arc::downgrade(&inner) as Weak<dyn TaskEntry>;
        registry.insert(id, entry);

        Self { inner }
    }

    pub fn id(&self) -> Id {
        self.inner.id
    }

    pub fn has_body(&self) -> bool {
        self.inner.has_body
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Current state. A task whose token has fired is cancelled before its
    /// state is returned, even if it had already finished.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_completed_successfully(&self) -> bool {
        self.state() == State::RanToCompletion
    }

    pub fn is_faulted(&self) -> bool {
        self.state() == State::Faulted
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }

    /// The result, once the task ran to completion.
    pub fn result(&self) -> Option<T> {
        match self.state() {
            State::RanToCompletion => self.inner.outcome.lock().result.clone(),
            _ => None,
        }
    }

    /// The failure, once the task faulted.
    pub fn failure(&self) -> Option<TaskFailure> {
        match self.state() {
            State::Faulted => self.inner.outcome.lock().failure.clone(),
            _ => None,
        }
    }

    /// Last value reported through [`TaskContext::report_progress`].
    pub fn progress(&self) -> Option<P> {
        self.inner.progress.lock().last.clone()
    }

    /// Hands the body to the bound scheduler.
    ///
    /// Fails if the task has no body, is a continuation (those run when their
    /// parent finishes), or was already scheduled, finished or cancelled.
    pub fn run(&self) -> Result<(), TaskError> {
        if self.inner.continuation {
            return Err(TaskError::Continuation { id: self.id() });
        }

        self.dispatch()
    }

    pub(crate) fn dispatch(&self) -> Result<(), TaskError> {
        if !self.inner.has_body {
            return Err(TaskError::MissingBody);
        }

        self.inner
            .state
            .transition(State::WaitingToRun, true)
            .map_err(|state| TaskError::NotSchedulable {
                id: self.id(),
                state,
            })?;

        tracing::trace!(id = %self.id(), "task scheduled");

        let task = self.clone();
        self.inner.scheduler.schedule(Box::new(move || task.execute()));

        Ok(())
    }

    /// Like [`run`](Task::run), for callers racing with cancellation or with
    /// another scheduling attempt.
    pub fn try_run(&self) -> bool {
        self.run().is_ok()
    }

    /// Completes a bodiless task. Returns `false` if it had already finished.
    pub fn set_result(&self, value: T) -> bool {
        self.inner.finish(Ok(value))
    }

    /// Faults a bodiless task. Returns `false` if it had already finished.
    pub fn set_failure(&self, error: impl Into<TaskFailure>) -> bool {
        self.inner.finish(Err(error.into()))
    }

    /// Cancels the task from whatever state it is in. Pending continuations
    /// are cancelled too and never run.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Continues with `f` on this task's scheduler once it ran to completion.
    ///
    /// The returned child is started by this task; calling
    /// [`run`](Task::run) on it fails with [`TaskError::Continuation`].
    pub fn on_success<U, F>(&self, f: F) -> Task<U>
    where
        U: Payload,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.on_success_in(&self.inner.scheduler, f)
    }

    /// Continues with `f` on `scheduler` once this task ran to completion.
    pub fn on_success_in<U, F>(&self, scheduler: &Scheduler, f: F) -> Task<U>
    where
        U: Payload,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        let (input, child) = self.child(scheduler, f);
        let link: Arc<dyn Continuation<T>> = Arc::new(Link::new(input, child.clone()));

        self.inner
            .attach(&self.inner.on_success, link, State::RanToCompletion, |inner| {
                inner.outcome.lock().result.clone()
            });

        child
    }

    /// Continues with `f` on this task's scheduler once it faulted. Like
    /// [`on_success`](Task::on_success), the child cannot be run by hand.
    pub fn on_failure<U, F>(&self, f: F) -> Task<U>
    where
        U: Payload,
        F: FnOnce(TaskFailure) -> anyhow::Result<U> + Send + 'static,
    {
        self.on_failure_in(&self.inner.scheduler, f)
    }

    /// Continues with `f` on `scheduler` once this task faulted.
    pub fn on_failure_in<U, F>(&self, scheduler: &Scheduler, f: F) -> Task<U>
    where
        U: Payload,
        F: FnOnce(TaskFailure) -> anyhow::Result<U> + Send + 'static,
    {
        let (input, child) = self.child(scheduler, f);
        let link: Arc<dyn Continuation<TaskFailure>> = Arc::new(Link::new(input, child.clone()));

        self.inner
            .attach(&self.inner.on_failure, link, State::Faulted, |inner| {
                inner.outcome.lock().failure.clone()
            });

        child
    }

    /// Calls `f` on this task's scheduler for every progress report.
    pub fn on_progress<F>(&self, f: F)
    where
        F: Fn(P) + Send + Sync + 'static,
    {
        self.on_progress_in(&self.inner.scheduler, f);
    }

    /// Calls `f` on `scheduler` for every progress report. Handlers
    /// registered on a finished task are ignored.
    pub fn on_progress_in<F>(&self, scheduler: &Scheduler, f: F)
    where
        F: Fn(P) + Send + Sync + 'static,
    {
        if self.state().is_terminal() {
            return;
        }

        // Teardown takes the handler list under this lock.
        let mut slot = self.inner.progress.lock();
        if !self.inner.state.load().is_terminal() {
            slot.handlers.push((Arc::new(f), scheduler.clone()));
        }
    }

    /// Returns `true` if both handles refer to the same task.
    pub fn ptr_eq(&self, other: &Task<T, P>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // A child runs `f` on whatever input its link stores before running it.
    fn child<I, U, F>(&self, scheduler: &Scheduler, f: F) -> (Arc<Mutex<Option<I>>>, Task<U>)
    where
        I: Send + 'static,
        U: Payload,
        F: FnOnce(I) -> anyhow::Result<U> + Send + 'static,
    {
        let input = Arc::new(Mutex::new(None::<I>));
        let slot = input.clone();

        let body = boxed_body::<U, (), _>(move |_| {
            let value = slot
                .lock()
                .take()
                .ok_or_else(|| anyhow!("continuation ran without its input"))?;
            f(value)
        });

        let child = Task::build(
            &self.inner.registry,
            scheduler.clone(),
            self.inner.token.clone(),
            Some(body),
            true,
        );

        (input, child)
    }

    fn execute(&self) {
        let inner = &self.inner;

        if inner.token.is_cancellation_requested() {
            inner.cancel();
            return;
        }

        if let Err(actual) = inner.state.transition(State::Running, true) {
            if !actual.is_terminal() {
                inner.force_fault(State::Running, actual);
            }
            return;
        }

        let body = inner.body.lock().take();
        let Some(body) = body else {
            inner.finish(Err(TaskError::MissingBody.into()));
            return;
        };

        tracing::trace!(id = %inner.id, "task running");

        let cx = TaskContext::new(inner);
        let outcome = match catch_unwind(AssertUnwindSafe(|| body(&cx))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TaskFailure::from(error)),
            Err(payload) => {
                let failure = TaskFailure::from_panic(payload);
                tracing::error!(id = %inner.id, %failure, "task body panicked");
                Err(failure)
            }
        };

        inner.finish(outcome);
    }
}

impl<T: Payload, P: Payload> fmt::Display for Task<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        write!(
            f,
            "task {} ({:?}): {}",
            self.id(),
            state,
            state.describe(self.has_body())
        )?;

        if let Some(failure) = self.failure() {
            write!(f, ": {failure}")?;
        }

        Ok(())
    }
}

impl<T, P> fmt::Debug for Task<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.load())
            .field("has_body", &self.inner.has_body)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}
