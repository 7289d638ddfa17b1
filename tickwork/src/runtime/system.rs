use crate::cancel::{CancellationToken, CancellationTokenSource};
use crate::clock::Clock;
use crate::runtime::{ActiveTasks, Builder, Phase, RuntimeConfig, TaskBuilder, TaskSnapshot};
use crate::scheduler::{
    BackgroundPool, BudgetedQueue, DedicatedThread, DelayedActions, DelayedDispatch, Scheduler,
    WorkerPool,
};
use crate::task::{Payload, Task, TaskContext, TaskError, TaskFailure};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// What one call to [`TaskSystem::drain`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Actions run from the phase's queue.
    pub executed: usize,

    /// Delayed actions released because they became due.
    pub delayed_fired: usize,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        self.executed == 0 && self.delayed_fired == 0
    }
}

impl std::ops::AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.executed += other.executed;
        self.delayed_fired += other.delayed_fired;
    }
}

/// Owns the schedulers, the registries and the clock a host drives each
/// tick.
///
/// Nothing scheduled on a phase runs until the host calls
/// [`drain`](TaskSystem::drain) for that phase. The background pool and the
/// dedicated-thread strategy run on their own threads.
pub struct TaskSystem {
    cfg: RuntimeConfig,

    tasks: Arc<ActiveTasks>,

    lanes: [Arc<BudgetedQueue>; 3],

    pool: Arc<WorkerPool>,

    background: Scheduler,

    dedicated: Scheduler,

    delayed: Arc<DelayedActions>,
}

impl TaskSystem {
    /// Creates a task system with the default configuration.
    pub fn new() -> Result<Self> {
        Builder::new().try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_config(cfg: RuntimeConfig) -> Result<Self> {
        let lanes = Phase::ALL.map(|phase| {
            Arc::new(BudgetedQueue::new(
                phase.name(),
                cfg.budget(phase),
                cfg.clock.clone(),
            ))
        });

        let pool = WorkerPool::new(
            cfg.pool_threads,
            &cfg.pool_thread_name,
            cfg.thread_stack_size,
        )?;

        let background = Scheduler::new(BackgroundPool::new(pool.clone()));
        let dedicated = Scheduler::new(DedicatedThread::new(
            cfg.dedicated_thread_name.clone(),
            cfg.thread_stack_size,
        ));

        tracing::debug!(
            pool_threads = cfg.pool_threads,
            delay_phase = %cfg.delay_phase,
            "task system started"
        );

        Ok(Self {
            cfg,
            tasks: ActiveTasks::new(),
            lanes,
            pool,
            background,
            dedicated,
            delayed: Arc::new(DelayedActions::new()),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.cfg.clock
    }

    pub fn delay_phase(&self) -> Phase {
        self.cfg.delay_phase
    }

    // --- Schedulers ---

    /// The budgeted queue of `phase`, as a scheduler.
    pub fn lane(&self, phase: Phase) -> Scheduler {
        Scheduler::from(self.lanes[phase.index()].clone())
    }

    pub fn lane_queue(&self, phase: Phase) -> &Arc<BudgetedQueue> {
        &self.lanes[phase.index()]
    }

    /// Changes the budget of `phase` and returns the clamped value stored.
    pub fn set_budget(&self, phase: Phase, budget_ms: u32) -> u32 {
        self.lane_queue(phase).set_budget(budget_ms)
    }

    pub fn background(&self) -> Scheduler {
        self.background.clone()
    }

    pub fn immediate(&self) -> Scheduler {
        Scheduler::immediate()
    }

    pub fn dedicated_thread(&self) -> Scheduler {
        self.dedicated.clone()
    }

    /// A scheduler that holds every action for `delay_ms` before handing it
    /// to `inner`.
    pub fn delayed(&self, inner: &Scheduler, delay_ms: u64) -> Result<Scheduler, TaskError> {
        let dispatch = DelayedDispatch::try_new(
            inner.clone(),
            delay_ms,
            self.delayed.clone(),
            self.cfg.clock.clone(),
        )?;

        Ok(Scheduler::new(dispatch))
    }

    pub fn delayed_actions(&self) -> &Arc<DelayedActions> {
        &self.delayed
    }

    // --- Pump ---

    /// Runs the queue of `phase` for its configured budget. Draining the
    /// delay phase also releases every delayed action that is due.
    pub fn drain(&self, phase: Phase) -> DrainReport {
        self.drain_for(phase, self.lane_queue(phase).budget_ms())
    }

    /// Like [`drain`](TaskSystem::drain) with an explicit budget, clamped to
    /// `[1, 100]` ms.
    pub fn drain_for(&self, phase: Phase, budget_ms: u32) -> DrainReport {
        let lane = self.lane_queue(phase);
        let executed = lane.drain_for(budget_ms);

        let delayed_fired = if phase == self.cfg.delay_phase {
            self.delayed
                .flush_due(self.cfg.clock.now_ms(), Some(lane.id()))
        } else {
            0
        };

        let report = DrainReport {
            executed,
            delayed_fired,
        };

        if !report.is_idle() {
            tracing::debug!(%phase, executed, delayed_fired, "phase drained");
        }

        report
    }

    /// Drains every phase once, in order.
    pub fn tick(&self) -> DrainReport {
        let mut report = DrainReport::default();
        for phase in Phase::ALL {
            report += self.drain(phase);
        }
        report
    }

    // --- Cancellation ---

    /// A cancellation source on this system's clock, so it can be given a
    /// deadline later.
    pub fn token_source(&self) -> CancellationTokenSource {
        CancellationTokenSource::with_clock(self.cfg.clock.clone())
    }

    /// A cancellation source that cancels itself `delay_ms` from now.
    pub fn cancel_after(&self, delay_ms: u64) -> CancellationTokenSource {
        CancellationTokenSource::with_timeout(self.cfg.clock.clone(), delay_ms)
    }

    // --- Tasks ---

    pub fn task(&self) -> TaskBuilder {
        TaskBuilder::new(self.tasks.clone())
    }

    /// Creates a task running `f` on `scheduler` and runs it.
    pub fn spawn<T, F>(&self, scheduler: &Scheduler, f: F) -> Result<Task<T>, TaskError>
    where
        T: Payload,
        F: FnOnce(&TaskContext<'_, T>) -> anyhow::Result<T> + Send + 'static,
    {
        let task = self.task().on(scheduler).body(f);
        task.run()?;
        Ok(task)
    }

    /// A task that already ran to completion with `value`.
    pub fn completed<T: Payload>(&self, value: T) -> Task<T> {
        let task = self.task().manual();
        task.set_result(value);
        task
    }

    /// A task that already faulted with `error`.
    pub fn failed<T: Payload>(&self, error: impl Into<TaskFailure>) -> Task<T> {
        let task = self.task().manual();
        task.set_failure(error);
        task
    }

    /// A task that is already cancelled.
    pub fn cancelled_task<T: Payload>(&self) -> Task<T> {
        let task = self
            .task()
            .with_token(CancellationToken::cancelled())
            .manual();
        task.cancel();
        task
    }

    /// A task that completes `delay_ms` from now, released by the drain of
    /// the delay phase.
    pub fn delay(&self, delay_ms: u64, token: CancellationToken) -> Result<Task, TaskError> {
        let dispatch = self.delayed(&Scheduler::immediate(), delay_ms)?;
        let task = self.task().with_token(token).manual::<()>();

        let timer = task.clone();
        dispatch.schedule(Box::new(move || {
            timer.set_result(());
        }));

        Ok(task)
    }

    // --- Registry ---

    pub fn tasks(&self) -> &Arc<ActiveTasks> {
        &self.tasks
    }

    /// Every unfinished task, in creation order.
    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        self.tasks.snapshot()
    }

    pub fn cancel_all(&self) -> usize {
        self.tasks.cancel_all()
    }

    /// Cancels every unfinished task, drops pending delayed actions and
    /// joins the background pool.
    pub fn shutdown(&self) -> Result<()> {
        let cancelled = self.cancel_all();
        let dropped = self.delayed.clear();

        tracing::debug!(cancelled, dropped, "shutting down task system");

        self.pool.shutdown()
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        if let Err(e) = self.pool.shutdown() {
            tracing::error!(error = %e, "task system shutdown failed");
        }
    }
}

impl fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSystem")
            .field("cfg", &self.cfg)
            .field("tasks", &self.tasks)
            .field("lanes", &self.lanes)
            .field("pool", &self.pool)
            .field("delayed", &self.delayed)
            .finish()
    }
}
