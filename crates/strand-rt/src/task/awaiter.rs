// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension points for task bodies.
//!
//! None of these is ever ready on its first poll: each one parks the task
//! and arranges for its waker to fire, and the waker puts the task back on
//! its own executor. That is what makes "resume on the awaiting task's
//! executor" hold for nested tasks and timers alike.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;

use crate::outcome::TaskError;
use crate::timer::DelayScheduler;

use super::promise::Promise;
use super::raw::current_timer;

/// Reschedule the rest of the task onto its executor.
///
/// With a looper this moves the task to the back of the queue; with a
/// new-thread executor the remainder runs on a fresh thread.
pub fn dispatch() -> Dispatch {
    Dispatch { yielded: false }
}

/// Alias of `dispatch`, for call sites that read better as a yield.
pub fn yield_now() -> Dispatch {
    dispatch()
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Dispatch {
    yielded: bool,
}

impl Future for Dispatch {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Waker slot a completion callback can fire after the awaiter moved on.
type SharedWaker = Arc<Mutex<Option<Waker>>>;

fn store_waker(slot: &SharedWaker, waker: &Waker) {
    let mut current = slot.lock();
    match current.as_ref() {
        Some(w) if w.will_wake(waker) => {}
        _ => *current = Some(waker.clone()),
    }
}

/// Awaits another task's outcome. Produced by `task.await`.
#[must_use = "futures do nothing unless awaited"]
pub struct TaskAwaiter<T> {
    promise: Arc<Promise<T>>,
    waker: Option<SharedWaker>,
}

impl<T> TaskAwaiter<T> {
    pub(crate) fn new(promise: Arc<Promise<T>>) -> Self {
        Self {
            promise,
            waker: None,
        }
    }
}

impl<T: Clone + Send + 'static> Future for TaskAwaiter<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(slot) = this.waker.clone() else {
            // First poll: hook a `finally` on the inner task and suspend,
            // even if it already finished.
            let slot: SharedWaker = Arc::new(Mutex::new(Some(cx.waker().clone())));
            let fire = slot.clone();
            this.waker = Some(slot);
            this.promise.on_completed(Box::new(move |_| {
                let waker = fire.lock().take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }));
            return Poll::Pending;
        };

        // Refresh the waker before peeking so a completion in between is
        // either seen here or wakes the current waker.
        store_waker(&slot, cx.waker());
        match this.promise.peek() {
            Some(outcome) => Poll::Ready(outcome.get_or_throw()),
            None => Poll::Pending,
        }
    }
}

/// Suspend the current task for at least `duration`.
///
/// The task's delay scheduler fires the wake-up; the body then resumes on
/// the task's executor. Outside a task, the shared scheduler is used.
pub fn sleep(duration: Duration) -> SleepAwaiter {
    SleepAwaiter {
        duration,
        timer: None,
        state: None,
    }
}

struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

#[must_use = "futures do nothing unless awaited"]
pub struct SleepAwaiter {
    duration: Duration,
    timer: Option<Arc<DelayScheduler>>,
    state: Option<Arc<Mutex<SleepState>>>,
}

impl SleepAwaiter {
    /// Use `timer` instead of the current task's delay scheduler.
    pub fn on(mut self, timer: Arc<DelayScheduler>) -> Self {
        self.timer = Some(timer);
        self
    }
}

impl Future for SleepAwaiter {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some(state) = &this.state {
            let mut state = state.lock();
            if state.fired {
                return Poll::Ready(());
            }
            match state.waker.as_ref() {
                Some(w) if w.will_wake(cx.waker()) => {}
                _ => state.waker = Some(cx.waker().clone()),
            }
            return Poll::Pending;
        }

        let state = Arc::new(Mutex::new(SleepState {
            fired: false,
            waker: Some(cx.waker().clone()),
        }));
        let timer = this
            .timer
            .clone()
            .or_else(current_timer)
            .unwrap_or_else(DelayScheduler::shared);
        let fire = state.clone();
        timer.schedule(
            move || {
                let waker = {
                    let mut state = fire.lock();
                    state.fired = true;
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            },
            this.duration,
        );
        this.state = Some(state);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, LooperExecutor, NewThreadExecutor};
    use crate::task::{Launch, Task, TaskBuilder};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn dispatch_moves_body_onto_executor() {
        let looper = Arc::new(LooperExecutor::new());
        let creator = thread::current().id();
        let task = TaskBuilder::new()
            .executor(looper)
            .launch(Launch::Immediate)
            .spawn(async move {
                let before = thread::current().id();
                dispatch().await;
                Ok::<_, TaskError>((before, thread::current().id()))
            });
        let (before, after) = task.get_result().unwrap();
        assert_eq!(before, creator);
        assert_ne!(after, creator);
    }

    #[test]
    fn nested_task_resumes_on_outer_executor() {
        let outer_exec = Arc::new(LooperExecutor::new());
        let outer_thread = {
            let (tx, rx) = std::sync::mpsc::channel();
            outer_exec.execute(Box::new(move || tx.send(thread::current().id()).unwrap()));
            rx.recv().unwrap()
        };

        let outer = Task::spawn(outer_exec, async move {
            let inner = Task::spawn(Arc::new(NewThreadExecutor), async {
                Ok::<_, TaskError>(thread::current().id())
            });
            let inner_thread = inner.await?;
            Ok::<_, TaskError>((inner_thread, thread::current().id()))
        });

        let (inner_thread, resumed_on) = outer.get_result().unwrap();
        assert_ne!(inner_thread, outer_thread);
        assert_eq!(resumed_on, outer_thread);
    }

    #[test]
    fn awaiting_a_finished_task_still_suspends_once() {
        let inner = Task::spawn(Arc::new(crate::executor::InlineExecutor), async {
            Ok::<_, TaskError>(5)
        });
        assert!(inner.is_complete());
        let outer = Task::spawn(Arc::new(LooperExecutor::new()), async move {
            let v = inner.await?;
            Ok::<_, TaskError>(v * 2)
        });
        assert_eq!(outer.get_result().unwrap(), 10);
    }

    #[test]
    fn inner_failure_surfaces_through_await() {
        let outer = Task::spawn(Arc::new(LooperExecutor::new()), async {
            let inner: Task<i32> = Task::spawn(Arc::new(NewThreadExecutor), async {
                Err(TaskError::failed("inner broke"))
            });
            inner.await
        });
        assert_eq!(outer.get_result().unwrap_err().to_string(), "inner broke");
    }

    #[test]
    fn sleep_waits_and_resumes_on_executor() {
        let looper = Arc::new(LooperExecutor::new());
        let timer = Arc::new(DelayScheduler::new());
        let task = TaskBuilder::new()
            .executor(looper)
            .timer(timer)
            .spawn(async {
                let start = Instant::now();
                let before = thread::current().id();
                sleep(Duration::from_millis(30)).await;
                Ok::<_, TaskError>((start.elapsed(), before, thread::current().id()))
            });
        let (elapsed, before, after) = task.get_result().unwrap();
        assert!(elapsed >= Duration::from_millis(30));
        assert_eq!(before, after);
    }

    #[test]
    fn zero_sleep_still_completes() {
        let task = Task::spawn(Arc::new(LooperExecutor::new()), async {
            sleep(Duration::ZERO).await;
            Ok::<_, TaskError>(())
        });
        task.get_result().unwrap();
    }

    #[test]
    fn sleep_forever_stays_pending() {
        let timer = Arc::new(DelayScheduler::new());
        let task = TaskBuilder::new()
            .executor(Arc::new(LooperExecutor::new()))
            .timer(timer.clone())
            .spawn(async {
                sleep(Duration::MAX).await;
                Ok::<_, TaskError>(())
            });
        crate::test_utils::wait_until("sleep to register", || timer.pending() == 1);
        assert!(task.get_result_timeout(Duration::from_millis(30)).is_none());
        // Discarding the entry releases the parked task.
        timer.shutdown(false);
    }

    #[test]
    fn long_inline_task_resumes_without_deep_recursion() {
        let task = Task::spawn(Arc::new(crate::executor::InlineExecutor), async {
            let mut resumed = 0u32;
            for _ in 0..100_000 {
                dispatch().await;
                resumed += 1;
            }
            Ok::<_, TaskError>(resumed)
        });
        assert!(task.is_complete());
        assert_eq!(task.get_result().unwrap(), 100_000);
    }
}
