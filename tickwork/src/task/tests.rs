use crate::cancel::CancellationTokenSource;
use crate::clock::ManualClock;
use crate::runtime::{Builder, TaskSystem};
use crate::scheduler::{Scheduler, WorkerPool};
use crate::task::{State, Task, TaskError, TaskFailure};
use crate::test_utils::{Call, HeldScheduler, Method, SpyScheduler};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Task<i32>: Send, Sync, Clone);
assert_impl_all!(Task<String, u8>: Send, Sync, Clone);
assert_impl_all!(TaskFailure: Send, Sync, Clone);

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("disk on fire")]
struct DiskOnFire;

fn system() -> Result<(TaskSystem, Arc<ManualClock>)> {
    let clock = Arc::new(ManualClock::new(0));
    let sys = Builder::new()
        .pool_threads(2)
        .pool_thread_name_fn(|| "task-test-pool".to_string())
        .clock(clock.clone())
        .try_build()?;
    Ok((sys, clock))
}

fn held() -> (Arc<HeldScheduler>, Scheduler) {
    let held = Arc::new(HeldScheduler::new());
    let scheduler = Scheduler::from(held.clone());
    (held, scheduler)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            return Err(anyhow!("timed out waiting for condition"));
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn test_body_runs_inline_on_immediate() -> Result<()> {
    let (sys, _) = system()?;

    let task: Task<i32> = sys.spawn(&sys.immediate(), |_| Ok(42))?;

    assert_eq!(task.state(), State::RanToCompletion);
    assert!(task.is_completed_successfully());
    assert_eq!(task.result(), Some(42));
    assert!(task.failure().is_none());
    assert!(sys.active_tasks().is_empty());
    Ok(())
}

#[test]
fn test_fault_reaches_failure_continuation_once() -> Result<()> {
    let (sys, _) = system()?;
    let (held, scheduler) = held();

    let task: Task<i32> = sys
        .task()
        .on(&scheduler)
        .body(|_| Err(anyhow::Error::new(DiskOnFire)));

    let successes = counter();
    let s = successes.clone();
    let on_success = task.on_success(move |_| {
        s.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let on_failure = task.on_failure(move |failure| {
        s.lock().push(failure);
        Ok("handled")
    });

    task.run()?;
    assert_eq!(task.state(), State::WaitingToRun);
    held.run_all();

    assert!(task.is_faulted());
    assert_eq!(
        task.failure().and_then(|f| f.downcast_ref::<DiskOnFire>().map(|_| ())),
        Some(())
    );

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].downcast_ref::<DiskOnFire>().is_some());
    assert_eq!(on_failure.result(), Some("handled"));

    assert_eq!(successes.load(Ordering::Relaxed), 0);
    assert!(on_success.is_cancelled());
    Ok(())
}

#[test]
fn test_cancel_drops_pending_continuations() -> Result<()> {
    let (sys, _) = system()?;
    let task = sys.task().manual::<i32>();
    let hits = counter();

    let children = (0..2)
        .map(|_| {
            let hits = hits.clone();
            task.on_success(move |v| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(v)
            })
        })
        .collect::<Vec<_>>();

    task.cancel();

    assert!(task.is_cancelled());
    assert!(!task.set_result(7));
    assert_eq!(task.result(), None);
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    assert!(children.iter().all(|c| c.is_cancelled()));
    assert!(sys.active_tasks().is_empty());
    Ok(())
}

#[test]
fn test_manual_completion_is_idempotent() -> Result<()> {
    let (sys, _) = system()?;
    let task = sys.task().manual::<i32>();

    assert!(task.set_result(1));
    assert!(!task.set_result(2));
    assert!(!task.set_failure(anyhow!("too late")));

    assert_eq!(task.result(), Some(1));
    assert_eq!(task.state(), State::RanToCompletion);
    Ok(())
}

#[test]
fn test_continuation_after_completion_runs_right_away() -> Result<()> {
    let (sys, _) = system()?;

    let doubled = sys.completed(5).on_success(|v| Ok(v * 2));
    assert_eq!(doubled.result(), Some(10));

    let chained = doubled
        .on_success(|v| Ok(v + 1))
        .on_success(|v| Ok(format!("{v}")));
    assert_eq!(chained.result().as_deref(), Some("11"));
    Ok(())
}

#[test]
fn test_continuation_of_other_outcome_never_runs() -> Result<()> {
    let (sys, _) = system()?;
    let hits = counter();

    let h = hits.clone();
    let after_cancel = sys.cancelled_task::<i32>().on_success(move |v| {
        h.fetch_add(1, Ordering::Relaxed);
        Ok(v)
    });

    let h = hits.clone();
    let after_success = sys.completed(1).on_failure(move |_| {
        h.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    let h = hits.clone();
    let after_failure = sys.failed::<i32>(anyhow!("nope")).on_success(move |_| {
        h.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    assert_eq!(hits.load(Ordering::Relaxed), 0);
    assert!(after_cancel.is_cancelled());
    assert!(after_success.is_cancelled());
    assert!(after_failure.is_cancelled());
    Ok(())
}

#[test]
fn test_token_cancellation_is_observed_on_read() -> Result<()> {
    let (sys, _) = system()?;
    let source = CancellationTokenSource::new();
    let task = sys.task().with_token(source.token()).manual::<i32>();

    assert_eq!(sys.active_tasks().len(), 1);
    assert_eq!(task.state(), State::Created);

    source.cancel();

    assert_eq!(task.state(), State::Cancelled);
    assert!(!task.set_result(1));
    assert!(sys.active_tasks().is_empty());
    Ok(())
}

#[test]
fn test_cancel_after_zero_skips_the_body() -> Result<()> {
    let (sys, _) = system()?;
    let source = sys.cancel_after(0);
    let ran = counter();

    assert!(source.is_cancellation_requested());

    let r = ran.clone();
    let task: Task = sys
        .task()
        .with_token(source.token())
        .body(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

    assert!(task.is_cancelled());
    assert!(task.run().is_err());
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn test_deadline_cancels_on_clock_advance() -> Result<()> {
    let (sys, clock) = system()?;
    let source = sys.cancel_after(30);
    let task = sys.task().with_token(source.token()).manual::<()>();

    clock.set(29);
    assert_eq!(task.state(), State::Created);

    clock.set(30);
    assert_eq!(task.state(), State::Cancelled);
    Ok(())
}

#[test]
fn test_run_requires_a_body() -> Result<()> {
    let (sys, _) = system()?;
    let task = sys.task().manual::<i32>();

    assert_eq!(task.run(), Err(TaskError::MissingBody));
    assert!(!task.try_run());
    assert_eq!(task.state(), State::Created);
    Ok(())
}

#[test]
fn test_second_run_is_not_schedulable() -> Result<()> {
    let (sys, _) = system()?;
    let (held, scheduler) = held();
    let task: Task<i32> = sys.task().on(&scheduler).body(|_| Ok(1));

    task.run()?;
    assert_eq!(
        task.run(),
        Err(TaskError::NotSchedulable {
            id: task.id(),
            state: State::WaitingToRun
        })
    );
    assert!(!task.try_run());
    assert_eq!(held.len(), 1);

    held.run_all();
    assert_eq!(task.result(), Some(1));
    assert!(matches!(
        task.run(),
        Err(TaskError::NotSchedulable {
            state: State::RanToCompletion,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_manual_setter_on_unstarted_body_forces_fault() -> Result<()> {
    let (sys, _) = system()?;
    let task: Task<i32> = sys.task().body(|_| Ok(1));

    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    task.on_failure(move |failure| {
        *s.lock() = Some(failure);
        Ok(())
    });

    assert!(!task.set_result(5));
    assert!(task.is_faulted());

    let failure = task.failure().ok_or_else(|| anyhow!("no failure"))?;
    assert_eq!(
        failure.downcast_ref::<TaskError>(),
        Some(&TaskError::InvalidTransition {
            id: task.id(),
            attempted: State::RanToCompletion,
            actual: State::Created,
        })
    );
    assert!(seen.lock().as_ref().is_some_and(|f| f.ptr_eq(&failure)));

    // The body never runs once the task is faulted.
    assert!(task.run().is_err());
    Ok(())
}

#[test]
fn test_panicking_body_faults_task() -> Result<()> {
    let (sys, _) = system()?;

    let task: Task<i32> = sys.spawn(&sys.immediate(), |_| panic!("boom"))?;

    assert!(task.is_faulted());
    let message = task.failure().map(|f| f.to_string()).unwrap_or_default();
    assert!(message.contains("boom"), "unexpected message: {message}");
    Ok(())
}

#[test]
fn test_cancellation_before_start_skips_body() -> Result<()> {
    let (sys, _) = system()?;
    let (held, scheduler) = held();
    let source = CancellationTokenSource::new();
    let ran = counter();

    let r = ran.clone();
    let task: Task = sys
        .task()
        .on(&scheduler)
        .with_token(source.token())
        .body(move |_| {
            r.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

    task.run()?;
    source.cancel();
    held.run_all();

    assert_eq!(ran.load(Ordering::Relaxed), 0);
    assert!(task.is_cancelled());
    Ok(())
}

#[test]
fn test_body_observes_cancellation_cooperatively() -> Result<()> {
    let (sys, _) = system()?;
    let source = CancellationTokenSource::new();
    let token_source = source.clone();

    let task: Task<u32> = sys
        .task()
        .with_token(source.token())
        .body(move |cx| {
            let mut steps = 0;
            while !cx.is_cancellation_requested() {
                steps += 1;
                if steps == 3 {
                    token_source.cancel();
                }
            }
            Ok(steps)
        });

    task.run()?;

    // The body returned normally, but its token fired while it ran.
    assert!(task.is_cancelled());
    assert_eq!(task.result(), None);
    Ok(())
}

#[test]
fn test_token_firing_after_completion_cancels_the_task() -> Result<()> {
    let (sys, _) = system()?;
    let source = CancellationTokenSource::new();
    let task: Task<i32> = sys.task().with_token(source.token()).body(|_| Ok(42));

    task.run()?;
    assert_eq!(task.result(), Some(42));

    source.cancel();

    assert_eq!(task.state(), State::Cancelled);
    assert_eq!(task.result(), None);
    assert!(!task.set_result(7));
    Ok(())
}

#[test]
fn test_progress_is_dropped_once_the_token_fires() -> Result<()> {
    let (sys, _) = system()?;
    let source = CancellationTokenSource::new();
    let token_source = source.clone();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let r = reports.clone();

    let task = sys
        .task()
        .with_token(source.token())
        .body_with_progress::<(), u8, _>(move |cx| {
            r.lock().push(cx.report_progress(1));
            token_source.cancel();
            r.lock().push(cx.report_progress(2));
            Ok(())
        });

    let hits = counter();
    let h = hits.clone();
    task.on_progress(move |_| {
        h.fetch_add(1, Ordering::Relaxed);
    });

    task.run()?;

    assert_eq!(*reports.lock(), vec![true, false]);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert_eq!(task.progress(), Some(1));
    assert!(task.is_cancelled());
    Ok(())
}

#[test]
fn test_continuation_children_cannot_be_run_by_hand() -> Result<()> {
    let (sys, _) = system()?;
    let parent = sys.task().manual::<i32>();
    let child = parent.on_success(|v| Ok(v + 1));
    let recovery = parent.on_failure(|_| Ok(0));

    assert_eq!(child.run(), Err(TaskError::Continuation { id: child.id() }));
    assert!(!recovery.try_run());
    assert_eq!(child.state(), State::Created);

    parent.set_result(1);
    assert_eq!(child.result(), Some(2));
    assert!(recovery.is_cancelled());
    Ok(())
}

#[test]
fn test_progress_reaches_handlers_on_their_scheduler() -> Result<()> {
    let (sys, _) = system()?;
    let (held, scheduler) = held();

    let task = sys
        .task()
        .body_with_progress::<&'static str, u8, _>(|cx| {
            for p in [10, 50, 100] {
                assert!(cx.report_progress(p));
            }
            Ok("done")
        });

    let inline = Arc::new(Mutex::new(Vec::new()));
    let i = inline.clone();
    task.on_progress(move |p| i.lock().push(p));

    let deferred = Arc::new(Mutex::new(Vec::new()));
    let d = deferred.clone();
    task.on_progress_in(&scheduler, move |p| d.lock().push(p));

    task.run()?;

    assert_eq!(task.result(), Some("done"));
    assert_eq!(task.progress(), Some(100));
    assert_eq!(*inline.lock(), vec![10, 50, 100]);

    assert!(deferred.lock().is_empty());
    assert_eq!(held.run_all(), 3);
    assert_eq!(*deferred.lock(), vec![10, 50, 100]);

    // Finished tasks take no more handlers.
    task.on_progress(|_| panic!("never called"));
    Ok(())
}

#[test]
fn test_display_describes_every_kind_of_task() -> Result<()> {
    let (sys, _) = system()?;

    let manual = sys.task().manual::<i32>();
    assert!(manual.to_string().contains("waiting for a result"));

    manual.set_failure(TaskFailure::new(DiskOnFire));
    let rendered = manual.to_string();
    assert!(rendered.contains("Faulted"));
    assert!(rendered.contains("set externally"));
    assert!(rendered.ends_with("disk on fire"));

    let bodied: Task<i32> = sys.task().body(|_| Ok(1));
    assert!(bodied.to_string().contains("waiting to be scheduled"));
    bodied.run()?;
    assert!(bodied.to_string().contains("ran to completion"));
    Ok(())
}

#[test]
fn test_registry_tracks_unfinished_tasks_in_id_order() -> Result<()> {
    let (sys, _) = system()?;
    let (held, scheduler) = held();

    let a = sys.task().manual::<i32>();
    let b: Task<i32> = sys.task().on(&scheduler).body(|_| Ok(2));
    b.run()?;

    {
        // Dropped before finishing: forgotten by the registry.
        let _c = sys.task().manual::<i32>();
        assert_eq!(sys.tasks().len(), 3);
    }

    let snapshot = sys.active_tasks();
    assert_eq!(
        snapshot.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![a.id(), b.id()]
    );
    assert_eq!(snapshot[0].state, State::Created);
    assert!(!snapshot[0].has_body);
    assert_eq!(snapshot[1].state, State::WaitingToRun);
    assert!(snapshot[1].has_body);

    a.set_result(1);
    held.run_all();
    assert!(sys.active_tasks().is_empty());
    assert!(sys.tasks().is_empty());
    Ok(())
}

#[test]
fn test_cancel_all_cancels_every_unfinished_task() -> Result<()> {
    let (sys, _) = system()?;
    let done = sys.completed(1);
    let pending = (0..3).map(|_| sys.task().manual::<i32>()).collect::<Vec<_>>();

    assert_eq!(sys.cancel_all(), 3);
    assert!(pending.iter().all(|t| t.is_cancelled()));
    assert_eq!(done.result(), Some(1));
    Ok(())
}

#[test]
fn test_failed_carries_the_supplied_error() -> Result<()> {
    let (sys, _) = system()?;
    let task = sys.failed::<i32>(TaskFailure::new(DiskOnFire));

    assert!(task.is_faulted());
    let failure = task.failure().ok_or_else(|| anyhow!("no failure"))?;
    assert_eq!(failure.downcast_ref::<DiskOnFire>(), Some(&DiskOnFire));
    Ok(())
}

#[test]
fn test_failing_handler_faults_its_child() -> Result<()> {
    let (sys, _) = system()?;

    let child = sys
        .completed(1)
        .on_success(|_| Err::<(), _>(anyhow!("handler failed")));
    let recovered = child.on_failure(|failure| Ok(failure.to_string()));

    assert!(child.is_faulted());
    assert_eq!(recovered.result().as_deref(), Some("handler failed"));
    Ok(())
}

#[test]
fn test_continuation_runs_on_its_own_scheduler() -> Result<()> {
    let (sys, _) = system()?;
    let (held, scheduler) = held();
    let spy = Arc::new(SpyScheduler::new(crate::scheduler::Immediate));

    let parent = sys.task().manual::<i32>();
    let deferred = parent.on_success_in(&scheduler, |v| Ok(v + 1));
    let spied = parent.on_success_in(&Scheduler::from(spy.clone()), |v| Ok(v + 2));

    parent.set_result(1);

    assert_eq!(spied.result(), Some(3));
    assert_eq!(spy.tracker.num_calls(&Method::Schedule), 1);
    assert_eq!(
        spy.tracker.get_calls(&Method::Schedule),
        vec![Call::Schedule { lane: None }]
    );

    assert_eq!(deferred.state(), State::WaitingToRun);
    held.run_all();
    assert_eq!(deferred.result(), Some(2));
    Ok(())
}

#[test]
fn test_background_pool_runs_tasks_and_continuations() -> Result<()> {
    let (sys, _) = system()?;
    let spy = Arc::new(SpyScheduler::new(crate::scheduler::BackgroundPool::new(
        WorkerPool::new(
            2,
            &crate::runtime::default_thread_name_fn("spy-pool"),
            None,
        )?,
    )));
    let scheduler = Scheduler::from(spy.clone());

    let tasks = (0..32u64)
        .map(|i| {
            sys.spawn(&scheduler, move |_| Ok(i))
                .map(|t| t.on_success(|v| Ok(v * 10)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    wait_until(|| tasks.iter().all(|t| t.is_finished()))?;

    let total: u64 = tasks.iter().filter_map(|t| t.result()).sum();
    assert_eq!(total, (0..32u64).sum::<u64>() * 10);

    // Parents and continuations each went through the pool once.
    wait_until(|| spy.tracker.num_calls(&Method::Run) == 64)?;
    assert!(spy.tracker.get_calls(&Method::Run).iter().all(|call| matches!(
        call,
        Call::Run { thread: Some(name) } if name.starts_with("spy-pool-")
    )));
    Ok(())
}

#[test]
fn test_registration_racing_completion_fires_exactly_once() -> Result<()> {
    let (sys, _) = system()?;
    let hits = counter();

    for i in 0..200 {
        let task = sys.task().manual::<usize>();

        let child = thread::scope(|s| {
            let t = task.clone();
            s.spawn(move || {
                t.set_result(i);
            });

            let hits = hits.clone();
            task.on_success(move |v| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(v)
            })
        });

        assert_eq!(child.result(), Some(i));
    }

    assert_eq!(hits.load(Ordering::Relaxed), 200);
    Ok(())
}
