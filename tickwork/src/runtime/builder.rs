use crate::clock::{Clock, MonotonicClock};
use crate::runtime::TaskSystem;
use crate::scheduler::clamp_budget;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Budget given to every phase unless configured otherwise.
const DEFAULT_BUDGET_MS: u32 = 10;

/// One of the three budgeted lanes a host pumps every tick, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PreTick,
    Tick,
    PostTick,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::PreTick, Phase::Tick, Phase::PostTick];

    pub fn name(self) -> &'static str {
        match self {
            Phase::PreTick => "pre-tick",
            Phase::Tick => "tick",
            Phase::PostTick => "post-tick",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

/// Yields `"{prefix}-{N}"` with N increasing from 0.
pub(crate) fn default_thread_name_fn(prefix: &str) -> ThreadNameFn {
    let prefix = prefix.to_string();
    let thread_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = thread_count.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", prefix, id)
    }))
}

impl ThreadNameFn {
    pub(crate) fn next_name(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Per-phase drain budgets in milliseconds, clamped to `[1, 100]`.
    budgets: [u32; 3],

    /// Background pool size. Defaults to 1 per core.
    pool_threads: Option<usize>,

    /// Name fn used for background pool workers.
    pool_thread_name: ThreadNameFn,

    /// Name fn used for threads started by the dedicated-thread strategy.
    dedicated_thread_name: ThreadNameFn,

    /// Stack size used for every thread the system spawns.
    thread_stack_size: Option<usize>,

    /// The phase whose drain also releases due delayed actions.
    delay_phase: Phase,

    /// Time source for budgets, delays and deadlines.
    clock: Option<Arc<dyn Clock>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            budgets: [DEFAULT_BUDGET_MS; 3],
            pool_threads: None,
            pool_thread_name: default_thread_name_fn("tickwork-pool"),
            dedicated_thread_name: default_thread_name_fn("tickwork-thread"),
            thread_stack_size: None,
            delay_phase: Phase::Tick,
            clock: None,
        }
    }

    /// Sets the drain budget of `phase`. Values outside `[1, 100]` ms are
    /// clamped.
    pub fn budget(mut self, phase: Phase, budget_ms: u32) -> Self {
        self.budgets[phase.index()] = clamp_budget(budget_ms);
        self
    }

    /// Sets the number of background pool workers. Must be greater than 0.
    pub fn pool_threads(mut self, val: usize) -> Self {
        self.pool_threads = Some(val);
        self
    }

    /// Gives every background pool worker the same name.
    pub fn pool_thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.pool_thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to name background pool workers.
    ///
    /// The default yields "tickwork-pool-{N}".
    pub fn pool_thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.pool_thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets a function used to name threads started per action by the
    /// dedicated-thread strategy.
    ///
    /// The default yields "tickwork-thread-{N}".
    pub fn dedicated_thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.dedicated_thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for every thread the system spawns.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the phase whose drain also flushes due delayed actions. Defaults
    /// to [`Phase::Tick`].
    pub fn delay_phase(mut self, phase: Phase) -> Self {
        self.delay_phase = phase;
        self
    }

    /// Sets the time source. Defaults to a [`MonotonicClock`] started at
    /// build time.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Creates the configured `TaskSystem`, starting its background pool.
    pub fn try_build(self) -> Result<TaskSystem> {
        let cfg = RuntimeConfig::try_from(self)?;
        TaskSystem::from_config(cfg)
    }
}

// Immutable snapshot of the builder consumed by the task system.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) budgets: [u32; 3],
    pub(crate) pool_threads: usize,
    pub(crate) pool_thread_name: ThreadNameFn,
    pub(crate) dedicated_thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) delay_phase: Phase,
    pub(crate) clock: Arc<dyn Clock>,
}

impl RuntimeConfig {
    pub(crate) fn budget(&self, phase: Phase) -> u32 {
        self.budgets[phase.index()]
    }

    fn validate(&self) -> Result<()> {
        if self.pool_threads == 0 {
            return Err(anyhow!("pool_threads must be greater than 0"));
        }

        if self.thread_stack_size == Some(0) {
            return Err(anyhow!("thread_stack_size must be greater than 0"));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let pool_threads = match builder.pool_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            budgets: builder.budgets,
            pool_threads,
            pool_thread_name: builder.pool_thread_name,
            dedicated_thread_name: builder.dedicated_thread_name,
            thread_stack_size: builder.thread_stack_size,
            delay_phase: builder.delay_phase,
            clock: builder
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
