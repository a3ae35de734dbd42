// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Tasks across executors: nesting, ordering, timers and callbacks.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{init_test_logging, looper};
use parking_lot::Mutex;
use strand_rt::{
    dispatch, sleep, DelayScheduler, Executor, ExecutorKind, InlineExecutor, LooperExecutor,
    NewThreadExecutor, PooledExecutor, RuntimeConfig, RuntimeContext, Task, TaskBuilder,
    TaskError,
};

#[test]
fn three_chained_tasks_sum() {
    init_test_logging();
    let outer = Task::spawn(looper(), async {
        let a = Task::spawn(Arc::new(NewThreadExecutor), async { Ok::<_, TaskError>(1) });
        let b = Task::spawn(Arc::new(PooledExecutor), async move {
            let a = a.await?;
            Ok::<_, TaskError>(a + 2)
        });
        let c = Task::spawn(looper(), async move {
            let b = b.await?;
            Ok::<_, TaskError>(b + 3)
        });
        c.await
    });
    assert_eq!(outer.get_result().unwrap(), 6);
}

#[test]
fn nested_await_sums_independent_tasks() {
    let outer = Task::spawn(looper(), async {
        let parts: Vec<Task<u32>> = (1..=3)
            .map(|i| Task::spawn(Arc::new(NewThreadExecutor), async move { Ok::<_, TaskError>(i) }))
            .collect();
        let mut sum = 0;
        for part in parts {
            sum += part.await?;
        }
        Ok::<_, TaskError>(sum)
    });
    assert_eq!(outer.get_result().unwrap(), 6);
}

#[test]
fn looper_serializes_task_bodies() {
    init_test_logging();
    const N: usize = 1000;
    let exec: Arc<dyn Executor> = looper();
    let counter = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..N)
        .map(|_| {
            let counter = counter.clone();
            Task::spawn(exec.clone(), async move {
                dispatch().await;
                // Load then store: only correct when bodies never overlap.
                let seen = counter.load(Ordering::Relaxed);
                counter.store(seen + 1, Ordering::Relaxed);
                Ok::<_, TaskError>(())
            })
        })
        .collect();

    for task in &tasks {
        task.get_result().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), N);
}

#[test]
fn looper_runs_tasks_in_submission_order() {
    let exec: Arc<dyn Executor> = looper();
    let order = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let order = order.clone();
            Task::spawn(exec.clone(), async move {
                order.lock().push(i);
                Ok::<_, TaskError>(())
            })
        })
        .collect();
    for task in tasks {
        task.get_result().unwrap();
    }
    assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn every_executor_kind_runs_sleep_and_dispatch() {
    init_test_logging();
    for kind in [
        ExecutorKind::Inline,
        ExecutorKind::NewThread,
        ExecutorKind::Pooled,
        ExecutorKind::Looper,
        ExecutorKind::SharedLooper,
    ] {
        let ctx = RuntimeContext::new(RuntimeConfig {
            executor: kind,
            ..RuntimeConfig::default()
        });
        let task = ctx.spawn(async {
            let start = Instant::now();
            dispatch().await;
            sleep(Duration::from_millis(5)).await;
            Ok::<_, TaskError>(start.elapsed())
        });
        let elapsed = task
            .get_result_timeout(Duration::from_secs(5))
            .unwrap_or_else(|| panic!("{kind} task never finished"))
            .unwrap();
        assert!(elapsed >= Duration::from_millis(5), "{kind} woke early");
    }
}

#[test]
fn sleeps_wake_in_deadline_order() {
    let timer = Arc::new(DelayScheduler::new());
    let exec: Arc<dyn Executor> = Arc::new(NewThreadExecutor);
    let order = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<_> = [40u64, 10, 25]
        .into_iter()
        .map(|ms| {
            let order = order.clone();
            TaskBuilder::new()
                .executor(exec.clone())
                .timer(timer.clone())
                .spawn(async move {
                    sleep(Duration::from_millis(ms)).await;
                    order.lock().push(ms);
                    Ok::<_, TaskError>(())
                })
        })
        .collect();
    for task in tasks {
        task.get_result().unwrap();
    }
    assert_eq!(*order.lock(), vec![10, 25, 40]);
}

#[test]
fn callbacks_see_outcome_from_completing_thread() {
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let task = Task::spawn(Arc::new(LooperExecutor::new()), async move {
        let _ = gate_rx.recv();
        Ok::<_, TaskError>(thread::current().id())
    });

    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    task.then(move |body_thread| {
        *s.lock() = Some(body_thread == thread::current().id());
    });
    gate_tx.send(()).unwrap();
    task.get_result().unwrap();
    common::wait_until("then callback", || seen.lock().is_some());
    assert_eq!(*seen.lock(), Some(true));
}

#[test]
fn failure_reaches_catching_and_finally() {
    let task: Task<()> = Task::spawn(Arc::new(InlineExecutor), async {
        Err(TaskError::failed("disk full"))
    });
    let caught = Arc::new(Mutex::new(Vec::new()));
    let (c1, c2) = (caught.clone(), caught.clone());
    task.catching(move |e| c1.lock().push(e.to_string()))
        .finally(move || c2.lock().push("finally".into()));
    assert_eq!(*caught.lock(), vec!["disk full".to_string(), "finally".into()]);
}

#[test]
fn shut_down_looper_drops_new_tasks() {
    let exec = Arc::new(LooperExecutor::new());
    exec.shutdown(true);
    exec.join();
    let task = Task::spawn(exec, async { Ok::<_, TaskError>(1) });
    assert!(task.get_result_timeout(Duration::from_millis(20)).is_none());
}
