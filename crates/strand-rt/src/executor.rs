// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution strategies.
//!
//! An executor decides where a unit of work runs. Tasks hand every
//! resumption to their executor, so the executor a task was built with is
//! the thread (or pool) its body observes at each suspension point.
//!
//! - `InlineExecutor`      runs work on the caller before returning
//! - `NewThreadExecutor`   one detached OS thread per submission
//! - `PooledExecutor`      submits to the process-wide rayon pool
//! - `LooperExecutor`      FIFO queue drained by one dedicated worker
//! - `SharedLooperExecutor` a process-wide looper, created on first use

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::outcome::panic_message;

/// A unit of work submitted to an executor.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// How to run a unit of work.
///
/// `execute` must not block waiting for the work to finish, except for
/// `InlineExecutor`, which runs it before returning.
pub trait Executor: Send + Sync {
    fn execute(&self, work: Work);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, work: Work) {
        (**self).execute(work)
    }
}

/// Runs work on the calling thread before returning.
///
/// Work submitted from inside inline work on the same thread (a task
/// rescheduling itself, say) is queued and run once the current work
/// returns, so chains of resumptions loop instead of growing the stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

thread_local! {
    /// Work waiting behind the inline work running on this thread.
    /// `None` while no inline work is running.
    static INLINE_BACKLOG: RefCell<Option<VecDeque<Work>>> = const { RefCell::new(None) };
}

/// Clears this thread's backlog when the outermost inline call returns or
/// unwinds.
struct InlineDrain;

impl Drop for InlineDrain {
    fn drop(&mut self) {
        let leftover = INLINE_BACKLOG.with(|backlog| backlog.borrow_mut().take());
        drop(leftover);
    }
}

impl Executor for InlineExecutor {
    fn execute(&self, work: Work) {
        let to_run = INLINE_BACKLOG.with(|backlog| {
            let mut backlog = backlog.borrow_mut();
            match backlog.as_mut() {
                Some(queue) => {
                    queue.push_back(work);
                    None
                }
                None => {
                    *backlog = Some(VecDeque::new());
                    Some(work)
                }
            }
        });
        let Some(first) = to_run else {
            return;
        };

        let _drain = InlineDrain;
        first();
        while let Some(next) = INLINE_BACKLOG
            .with(|backlog| backlog.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            next();
        }
    }
}

/// Spawns a fresh, detached OS thread for every submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewThreadExecutor;

impl Executor for NewThreadExecutor {
    fn execute(&self, work: Work) {
        let spawned = thread::Builder::new()
            .name("strand-thread".to_string())
            .spawn(work);
        if let Err(err) = spawned {
            error!(%err, "failed to spawn executor thread, work dropped");
        }
    }
}

/// Submits work to the ambient rayon thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct PooledExecutor;

impl Executor for PooledExecutor {
    fn execute(&self, work: Work) {
        rayon::spawn(work);
    }
}

/// Looper lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperState {
    /// Accepting and running work.
    Running,
    /// Shut down; the worker finishes what is queued, then exits.
    Draining,
    /// Worker has exited.
    Stopped,
}

struct LooperQueue {
    queue: VecDeque<Work>,
    state: LooperState,
}

struct LooperShared {
    inner: Mutex<LooperQueue>,
    /// Signalled on every submission and on shutdown.
    work_available: Condvar,
}

/// Serializes work onto one background thread, in submission order.
pub struct LooperExecutor {
    shared: Arc<LooperShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl LooperExecutor {
    /// Start a looper with a worker thread named `strand-looper`.
    pub fn new() -> Self {
        Self::with_name("strand-looper")
    }

    /// Start a looper whose worker thread carries `name`.
    ///
    /// Panics if the OS refuses to create the worker thread.
    pub fn with_name(name: &str) -> Self {
        let shared = Arc::new(LooperShared {
            inner: Mutex::new(LooperQueue {
                queue: VecDeque::new(),
                state: LooperState::Running,
            }),
            work_available: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(&worker_shared))
            .expect("failed to spawn looper thread");
        let worker_id = handle.thread().id();
        debug!(thread = name, "looper started");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        }
    }

    pub fn state(&self) -> LooperState {
        self.shared.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == LooperState::Running
    }

    /// Stop accepting work.
    ///
    /// With `wait_for_complete`, the worker runs everything already queued
    /// before exiting. Without it, the queue is cleared and the worker exits
    /// as soon as its current unit of work (if any) returns.
    pub fn shutdown(&self, wait_for_complete: bool) {
        let dropped = {
            let mut inner = self.shared.inner.lock();
            if inner.state == LooperState::Running {
                inner.state = LooperState::Draining;
            }
            if wait_for_complete {
                VecDeque::new()
            } else {
                std::mem::take(&mut inner.queue)
            }
        };
        self.shared.work_available.notify_all();
        debug!(wait_for_complete, dropped = dropped.len(), "looper shutdown requested");
        // Dropped closures may own task state; release them outside the lock.
        drop(dropped);
    }

    /// Wait for the worker thread to exit. Call `shutdown` first.
    pub fn join(&self) {
        if thread::current().id() == self.worker_id {
            // Joining ourselves would never return; the worker exits on its own.
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("looper worker panicked");
            }
        }
    }
}

impl Default for LooperExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LooperExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("LooperExecutor")
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

impl Executor for LooperExecutor {
    fn execute(&self, work: Work) {
        let mut inner = self.shared.inner.lock();
        if inner.state != LooperState::Running {
            drop(inner);
            trace!("looper is shut down, dropping submitted work");
            return;
        }
        inner.queue.push_back(work);
        drop(inner);
        self.shared.work_available.notify_one();
    }
}

impl Drop for LooperExecutor {
    fn drop(&mut self) {
        self.shutdown(false);
        self.join();
    }
}

/// Worker main loop: pop in FIFO order, run outside the lock, park when idle.
fn run_loop(shared: &LooperShared) {
    loop {
        let work = {
            let mut inner = shared.inner.lock();
            loop {
                if let Some(work) = inner.queue.pop_front() {
                    break work;
                }
                if inner.state != LooperState::Running {
                    inner.state = LooperState::Stopped;
                    debug!("looper worker exiting");
                    return;
                }
                shared.work_available.wait(&mut inner);
            }
        };

        // A panicking unit of work must not take the worker down with it.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            error!(panic = %panic_message(payload.as_ref()), "looper work panicked");
        }
    }
}

/// Process-wide looper, started on first use and never torn down.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedLooperExecutor;

impl SharedLooperExecutor {
    pub fn looper() -> &'static LooperExecutor {
        static SHARED: OnceLock<LooperExecutor> = OnceLock::new();
        SHARED.get_or_init(|| LooperExecutor::with_name("strand-shared-looper"))
    }
}

impl Executor for SharedLooperExecutor {
    fn execute(&self, work: Work) {
        Self::looper().execute(work);
    }
}

/// Execution strategy selection, e.g. from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorKind {
    Inline,
    NewThread,
    Pooled,
    #[default]
    Looper,
    SharedLooper,
}

impl ExecutorKind {
    /// Build an executor of this kind. `Looper` starts a new worker thread
    /// every call; the others are stateless.
    pub fn build(self) -> Arc<dyn Executor> {
        match self {
            ExecutorKind::Inline => Arc::new(InlineExecutor),
            ExecutorKind::NewThread => Arc::new(NewThreadExecutor),
            ExecutorKind::Pooled => Arc::new(PooledExecutor),
            ExecutorKind::Looper => Arc::new(LooperExecutor::new()),
            ExecutorKind::SharedLooper => Arc::new(SharedLooperExecutor),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::Inline => "inline",
            ExecutorKind::NewThread => "new-thread",
            ExecutorKind::Pooled => "pooled",
            ExecutorKind::Looper => "looper",
            ExecutorKind::SharedLooper => "shared-looper",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized executor name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown executor kind `{0}` (expected inline, new-thread, pooled, looper or shared-looper)")]
pub struct UnknownExecutor(pub String);

impl FromStr for ExecutorKind {
    type Err = UnknownExecutor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "noop" => Ok(ExecutorKind::Inline),
            "new-thread" | "thread" => Ok(ExecutorKind::NewThread),
            "pooled" | "async" => Ok(ExecutorKind::Pooled),
            "looper" => Ok(ExecutorKind::Looper),
            "shared-looper" => Ok(ExecutorKind::SharedLooper),
            other => Err(UnknownExecutor(other.to_string())),
        }
    }
}
