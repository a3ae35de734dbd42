// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task handle and builder.
//!
//! A `Task<T>` is a cheap, cloneable view of one running computation. The
//! computation itself is kept alive by whatever will resume it next (its
//! executor queue, a timer, a channel, another task's callback list), never
//! by the handle, so dropping every handle just detaches the task.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tracing::{trace, warn};

use crate::executor::{Executor, InlineExecutor};
use crate::outcome::{panic_message, Outcome, TaskError};
use crate::timer::DelayScheduler;

use super::awaiter::TaskAwaiter;
use super::promise::Promise;
use super::raw::{RawTask, TaskId};

/// Where a task's first poll runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Launch {
    /// The first poll is handed to the executor; no body code runs on the
    /// creating thread.
    #[default]
    Dispatched,
    /// The body runs on the creating thread up to its first suspension
    /// point; later resumptions go through the executor.
    Immediate,
}

/// What happens when a `then` callback panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackPolicy {
    /// Log and carry on.
    #[default]
    Swallow,
    /// Re-raise on the thread that completed the task, after the remaining
    /// callbacks have run.
    Propagate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown callback policy `{0}` (expected swallow or propagate)")]
pub struct UnknownPolicy(pub String);

impl FromStr for CallbackPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "swallow" | "ignore" => Ok(CallbackPolicy::Swallow),
            "propagate" => Ok(CallbackPolicy::Propagate),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// Handle to a suspendable computation producing a `T`.
pub struct Task<T> {
    id: TaskId,
    promise: Arc<Promise<T>>,
    policy: CallbackPolicy,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            promise: self.promise.clone(),
            policy: self.policy,
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Start `body` on `executor` with default settings.
    pub fn spawn<F, E>(executor: Arc<dyn Executor>, body: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<TaskError> + 'static,
    {
        TaskBuilder::new().executor(executor).spawn(body)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the calling thread until the task finishes.
    pub fn get_result(&self) -> Result<T, TaskError> {
        self.promise.wait().get_or_throw()
    }

    /// Like `get_result`, but gives up after `timeout`.
    pub fn get_result_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        self.promise
            .wait_timeout(timeout)
            .map(Outcome::get_or_throw)
    }

    /// The result, if the task has already finished.
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        self.promise.peek().map(Outcome::get_or_throw)
    }

    pub fn is_complete(&self) -> bool {
        self.promise.is_complete()
    }

    /// Run `on_success` with the value once the task succeeds.
    ///
    /// Never called on failure. Panics inside the callback follow the
    /// task's `CallbackPolicy`.
    pub fn then<F>(&self, on_success: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        let policy = self.policy;
        let id = self.id;
        self.promise.on_completed(Box::new(move |outcome| {
            let Outcome::Value(value) = outcome else {
                return;
            };
            match policy {
                CallbackPolicy::Propagate => on_success(value),
                CallbackPolicy::Swallow => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || on_success(value))) {
                        warn!(
                            task = id,
                            panic = %panic_message(payload.as_ref()),
                            "`then` callback panicked, ignoring"
                        );
                    }
                }
            }
        }));
        self
    }

    /// Run `on_failure` with the failure once the task fails.
    pub fn catching<F>(&self, on_failure: F) -> &Self
    where
        F: FnOnce(TaskError) + Send + 'static,
    {
        self.promise.on_completed(Box::new(move |outcome| {
            if let Outcome::Failure(err) = outcome {
                on_failure(err);
            }
        }));
        self
    }

    /// Run `on_always` once the task finishes either way.
    pub fn finally<F>(&self, on_always: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.promise.on_completed(Box::new(move |_| on_always()));
        self
    }

    /// Give up this handle; the computation keeps running.
    pub fn detach(self) {
        trace!(task = self.id, "task handle detached");
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Task<T> {
    type Output = Result<T, TaskError>;
    type IntoFuture = TaskAwaiter<T>;

    /// Await from inside another task. The awaiting task resumes on its
    /// own executor, not on the one that completed this task.
    fn into_future(self) -> Self::IntoFuture {
        TaskAwaiter::new(self.promise)
    }
}

/// Configures and starts a task.
#[derive(Clone)]
pub struct TaskBuilder {
    executor: Arc<dyn Executor>,
    timer: Option<Arc<DelayScheduler>>,
    launch: Launch,
    policy: CallbackPolicy,
}

impl fmt::Debug for TaskBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("launch", &self.launch)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TaskBuilder {
    /// Inline executor, shared delay scheduler, dispatched launch,
    /// swallowing `then` panics.
    pub fn new() -> Self {
        Self {
            executor: Arc::new(InlineExecutor),
            timer: None,
            launch: Launch::default(),
            policy: CallbackPolicy::default(),
        }
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Delay scheduler used by `sleep` inside the body.
    pub fn timer(mut self, timer: Arc<DelayScheduler>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn launch(mut self, launch: Launch) -> Self {
        self.launch = launch;
        self
    }

    pub fn callback_policy(mut self, policy: CallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start `body`. Errors it returns and panics it raises both end up as
    /// the task's failure.
    pub fn spawn<T, F, E>(self, body: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<TaskError> + 'static,
    {
        let promise = Arc::new(Promise::new());
        let guarded = CatchBody {
            body: Box::pin(body),
            promise: promise.clone(),
        };
        let timer = self.timer.unwrap_or_else(DelayScheduler::shared);
        let raw = RawTask::new(Box::pin(guarded), self.executor, timer);
        let id = raw.id();
        trace!(task = id, launch = ?self.launch, "task spawned");

        match self.launch {
            Launch::Dispatched => raw.dispatch(),
            Launch::Immediate => raw.run(),
        }

        Task {
            id,
            promise,
            policy: self.policy,
        }
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a body so its result, or its panic, settles the promise.
struct CatchBody<F, T> {
    body: Pin<Box<F>>,
    promise: Arc<Promise<T>>,
}

impl<F, T, E> Future for CatchBody<F, T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TaskError>,
    T: Clone,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let polled = catch_unwind(AssertUnwindSafe(|| self.body.as_mut().poll(cx)));
        let outcome = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(result)) => Outcome::from(result),
            Err(payload) => Outcome::Failure(TaskError::from_panic(payload)),
        };
        self.promise.complete(outcome);
        Poll::Ready(())
    }
}
