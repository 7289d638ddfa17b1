use crate::runtime::ThreadNameFn;
use crate::scheduler::{Action, Schedule, run_contained};
use anyhow::{Context, Result, anyhow};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// A fixed set of named worker threads pulling actions from one shared
/// injector queue.
///
/// There is no stealing between workers and no per-worker queue. Idle workers
/// park on a condition variable until an action is submitted or the pool
/// shuts down.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    num_threads: usize,
}

struct Shared {
    injector: Injector<Action>,

    // Submitters take this lock between pushing and notifying, which closes
    // the window where a worker saw an empty queue but is not waiting yet.
    idle: Mutex<()>,
    wakeup: Condvar,

    shutdown: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn new(
        num_threads: usize,
        thread_name: &ThreadNameFn,
        stack_size: Option<usize>,
    ) -> Result<Arc<Self>> {
        if num_threads == 0 {
            return Err(anyhow!("worker pool needs at least one thread"));
        }

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            idle: Mutex::new(()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..num_threads)
            .map(|_| spawn_worker_thread(shared.clone(), thread_name, stack_size))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(num_threads, "worker pool started");

        Ok(Arc::new(Self {
            shared,
            handles: Mutex::new(handles),
            num_threads,
        }))
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Queues `action` for the next idle worker. Actions submitted after
    /// shutdown are dropped.
    pub fn submit(&self, action: Action) {
        if self.is_shutdown() {
            tracing::warn!("worker pool is shut down, dropping action");
            return;
        }

        self.shared.injector.push(action);
        drop(self.shared.idle.lock());
        self.shared.wakeup.notify_one();
    }

    /// Stops the workers once the queue is empty and joins them. Calling it
    /// from one of the pool's own workers skips joining that worker.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        drop(self.shared.idle.lock());
        self.shared.wakeup.notify_all();

        let current = thread::current().id();
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .filter(|handle| handle.thread().id() != current)
            .filter_map(|handle| handle.join().err())
            .count();

        tracing::debug!("worker pool stopped");

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "worker pool shutdown failed");
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads)
            .field("queued", &self.shared.injector.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn spawn_worker_thread(
    shared: Arc<Shared>,
    thread_name: &ThreadNameFn,
    stack_size: Option<usize>,
) -> Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new().name(thread_name.next_name());

    if let Some(stack_size) = stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || worker_loop(&shared))
        .context("failed to spawn worker thread")
}

fn worker_loop(shared: &Shared) {
    loop {
        match shared.injector.steal() {
            Steal::Success(action) => {
                run_contained(action, "background-pool");
            }
            Steal::Retry => continue,
            Steal::Empty => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }

                let mut guard = shared.idle.lock();
                if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                    shared.wakeup.wait(&mut guard);
                }
            }
        }
    }
}

/// Hands every action to a shared [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct BackgroundPool {
    pool: Arc<WorkerPool>,
}

impl BackgroundPool {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

impl Schedule for BackgroundPool {
    fn schedule(&self, action: Action) {
        self.pool.submit(action);
    }
}
