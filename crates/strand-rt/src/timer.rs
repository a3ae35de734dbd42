// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Delay scheduler.
//!
//! One timer thread sleeps until the earliest deadline in a min-heap, then
//! runs that continuation. Continuations run on the timer thread; callers
//! that care where the real work happens forward it to an executor (the
//! sleep awaiter does this by waking its task).
//!
//! Instances are normally injected through `RuntimeContext`. `shared()` is
//! the process-wide fallback: created on first use, never torn down.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::executor::Work;
use crate::outcome::panic_message;

/// A continuation waiting for its deadline.
struct Delayed {
    deadline: Instant,
    /// Submission order, so equal deadlines fire FIFO.
    seq: u64,
    work: Work,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Running,
    Draining,
    Stopped,
}

struct TimerQueue {
    heap: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
    state: TimerState,
}

struct TimerShared {
    inner: Mutex<TimerQueue>,
    /// Signalled when a new earliest deadline arrives or on shutdown.
    changed: Condvar,
}

/// Stand-in deadline distance for delays that overflow `Instant`, such as
/// `Duration::MAX`. About thirty years.
pub const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        // Only reachable on clocks that cannot represent thirty years ahead.
        .unwrap_or(now)
}

/// Runs continuations once their delay has elapsed.
pub struct DelayScheduler {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl DelayScheduler {
    /// Start a scheduler with its own timer thread.
    ///
    /// Panics if the OS refuses to create the thread.
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            inner: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                state: TimerState::Running,
            }),
            changed: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("strand-timer".to_string())
            .spawn(move || timer_loop(&worker_shared))
            .expect("failed to spawn timer thread");
        let worker_id = handle.thread().id();

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        }
    }

    /// The process-wide scheduler.
    pub fn shared() -> Arc<DelayScheduler> {
        static SHARED: OnceLock<Arc<DelayScheduler>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(DelayScheduler::new())).clone()
    }

    /// Run `continuation` once, no earlier than `delay` from now.
    ///
    /// Delays past what `Instant` can represent are clamped to `FAR_FUTURE`.
    /// Ignored after `shutdown`.
    pub fn schedule<F>(&self, continuation: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = deadline_after(delay);
        let mut inner = self.shared.inner.lock();
        if inner.state != TimerState::Running {
            trace!("delay scheduler is shut down, dropping continuation");
            return;
        }
        let need_notify = inner
            .heap
            .peek()
            .map_or(true, |Reverse(next)| next.deadline > deadline);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(Delayed {
            deadline,
            seq,
            work: Box::new(continuation),
        }));
        drop(inner);

        if need_notify {
            self.shared.changed.notify_one();
        }
    }

    /// Number of continuations still waiting.
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().heap.len()
    }

    /// Stop accepting continuations.
    ///
    /// With `wait_for_complete`, everything already scheduled still fires
    /// at its deadline before the thread exits; otherwise it is discarded.
    pub fn shutdown(&self, wait_for_complete: bool) {
        let dropped = {
            let mut inner = self.shared.inner.lock();
            if inner.state == TimerState::Running {
                inner.state = TimerState::Draining;
            }
            if wait_for_complete {
                BinaryHeap::new()
            } else {
                std::mem::take(&mut inner.heap)
            }
        };
        self.shared.changed.notify_all();
        debug!(wait_for_complete, dropped = dropped.len(), "delay scheduler shutdown requested");
        drop(dropped);
    }

    /// Wait for the timer thread to exit. Call `shutdown` first.
    pub fn join(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

impl Default for DelayScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("DelayScheduler")
            .field("state", &inner.state)
            .field("pending", &inner.heap.len())
            .finish()
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.shutdown(false);
        self.join();
    }
}

fn timer_loop(shared: &TimerShared) {
    loop {
        let work = {
            let mut inner = shared.inner.lock();
            loop {
                let next_deadline = inner.heap.peek().map(|Reverse(next)| next.deadline);
                match next_deadline {
                    Some(deadline) if deadline <= Instant::now() => {
                        if let Some(Reverse(due)) = inner.heap.pop() {
                            break due.work;
                        }
                    }
                    Some(deadline) => {
                        // Woken early when an earlier deadline is pushed.
                        shared.changed.wait_until(&mut inner, deadline);
                    }
                    None if inner.state != TimerState::Running => {
                        inner.state = TimerState::Stopped;
                        debug!("timer thread exiting");
                        return;
                    }
                    None => shared.changed.wait(&mut inner),
                }
            }
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            error!(panic = %panic_message(payload.as_ref()), "delayed continuation panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let timer = DelayScheduler::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        timer.schedule(move || tx.send(Instant::now()).unwrap(), Duration::from_millis(20));
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(20));
    }

    #[test]
    fn earlier_deadline_preempts() {
        let timer = DelayScheduler::new();
        let (tx, rx) = mpsc::channel();
        let slow = tx.clone();
        timer.schedule(move || slow.send("slow").unwrap(), Duration::from_millis(200));
        timer.schedule(move || tx.send("fast").unwrap(), Duration::from_millis(10));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fast");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "slow");
    }

    #[test]
    fn equal_deadlines_fire_in_submission_order() {
        let timer = DelayScheduler::new();
        let (tx, rx) = mpsc::channel();
        // One timer thread pops in (deadline, seq) order.
        for i in 0..10 {
            let tx = tx.clone();
            timer.schedule(move || tx.send(i).unwrap(), Duration::ZERO);
        }
        let got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn graceful_shutdown_still_fires_pending() {
        let timer = DelayScheduler::new();
        let (tx, rx) = mpsc::channel();
        timer.schedule(move || tx.send(1).unwrap(), Duration::from_millis(20));
        timer.shutdown(true);
        timer.join();
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn hard_shutdown_discards_pending() {
        let timer = DelayScheduler::new();
        let (tx, rx) = mpsc::channel::<i32>();
        timer.schedule(move || tx.send(1).unwrap(), Duration::from_secs(60));
        assert_eq!(timer.pending(), 1);
        drop(timer);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shared_instance_is_reused() {
        let a = DelayScheduler::shared();
        let b = DelayScheduler::shared();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn overflowing_delay_is_clamped_not_fired() {
        let timer = DelayScheduler::new();
        let (tx, rx) = mpsc::channel::<()>();
        timer.schedule(move || tx.send(()).unwrap(), Duration::MAX);
        assert_eq!(timer.pending(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
        timer.shutdown(false);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn deadline_after_saturates() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= before + FAR_FUTURE);
    }
}
