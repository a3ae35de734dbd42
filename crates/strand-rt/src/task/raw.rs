// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Type-erased task body and its run-state machine.
//!
//! A `RawTask` owns the boxed body future plus the executor and delay
//! scheduler it was built with. Every poll happens inside a unit of work
//! submitted to that executor, so wherever a waker fires (timer thread,
//! another task's completion, a channel peer), the body resumes on its own
//! executor.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Wake, Waker};

use parking_lot::Mutex;
use tracing::trace;

use crate::executor::Executor;
use crate::timer::DelayScheduler;

/// Run states.
///
/// ```text
///   Scheduled --run--> Running --pending--> Waiting --wake--> Scheduled
///                         |  \--wake--> Notified --pending--> Scheduled
///                         \--ready--> Completed
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    /// A poll is queued on the executor.
    Scheduled = 0,
    /// Being polled right now.
    Running = 1,
    /// Parked at a suspension point, waiting for a waker.
    Waiting = 2,
    /// Woken while being polled; re-dispatch once the poll returns.
    Notified = 3,
    /// Body finished; nothing left to poll.
    Completed = 4,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Scheduled,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Notified,
            _ => Self::Completed,
        }
    }
}

/// Identifies a task in logs.
pub type TaskId = u64;

fn next_task_id() -> TaskId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct RawTask {
    id: TaskId,
    state: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    executor: Arc<dyn Executor>,
    timer: Arc<DelayScheduler>,
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl RawTask {
    pub fn new(
        future: BoxFuture,
        executor: Arc<dyn Executor>,
        timer: Arc<DelayScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_task_id(),
            state: AtomicU8::new(RunState::Scheduled as u8),
            future: Mutex::new(Some(future)),
            executor,
            timer,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queue a poll on the task's executor. Caller must have moved the
    /// task into `Scheduled`.
    pub fn dispatch(self: &Arc<Self>) {
        let task = self.clone();
        self.executor.execute(Box::new(move || task.run()));
    }

    /// Poll once. Runs on whatever thread the executor picked, except for the
    /// first poll of an immediately-launched task.
    pub fn run(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                RunState::Scheduled as u8,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let polled = catch_unwind(AssertUnwindSafe(|| self.poll()));
        let completed = match polled {
            Ok(done) => done,
            Err(payload) => {
                // Body panics are caught below us; this is a completion
                // callback that opted into propagation.
                self.finish();
                resume_unwind(payload);
            }
        };

        if completed {
            self.finish();
            return;
        }

        let parked = self.state.compare_exchange(
            RunState::Running as u8,
            RunState::Waiting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if parked.is_err() {
            // Woken during the poll (Running -> Notified).
            self.state
                .store(RunState::Scheduled as u8, Ordering::Release);
            self.dispatch();
        }
    }

    fn finish(&self) {
        self.state
            .store(RunState::Completed as u8, Ordering::Release);
        let future = self.future.lock().take();
        drop(future);
        trace!(task = self.id, "task body finished");
    }

    /// Returns true once the body future has resolved.
    fn poll(self: &Arc<Self>) -> bool {
        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(fut) = slot.as_mut() else {
            return true;
        };

        let _enter = CurrentTask::enter(self.timer.clone());
        fut.as_mut().poll(&mut cx).is_ready()
    }

    fn wake(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match RunState::from_u8(current) {
                RunState::Waiting => RunState::Scheduled,
                RunState::Running => RunState::Notified,
                // Already queued, already flagged, or done.
                RunState::Scheduled | RunState::Notified | RunState::Completed => return,
            };
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == RunState::Scheduled {
                        self.dispatch();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Waker that hands the task back to its executor.
struct TaskWaker {
    task: Arc<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.task.wake();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.wake();
    }
}

thread_local! {
    static CURRENT_TIMER: RefCell<Option<Arc<DelayScheduler>>> = const { RefCell::new(None) };
}

/// Marks the delay scheduler of the task being polled on this thread.
/// Restores the previous value on drop, so inline executors can nest polls.
struct CurrentTask {
    previous: Option<Arc<DelayScheduler>>,
}

impl CurrentTask {
    fn enter(timer: Arc<DelayScheduler>) -> Self {
        let previous = CURRENT_TIMER.with(|cell| cell.borrow_mut().replace(timer));
        Self { previous }
    }
}

impl Drop for CurrentTask {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TIMER.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Delay scheduler of the task currently being polled, if any.
pub(crate) fn current_timer() -> Option<Arc<DelayScheduler>> {
    CURRENT_TIMER.with(|cell| cell.borrow().clone())
}
