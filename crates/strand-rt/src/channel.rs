// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded and rendezvous channels between tasks.
//!
//! A write hands its value, in order of preference, to the oldest parked
//! reader, to a free buffer slot, or parks. A read takes from the buffer
//! (refilling the freed slot from the oldest parked writer), then from a
//! parked writer, or parks. Capacity 0 never buffers: both sides meet.
//!
//! Parked operations are `Waiter`s in FIFO lists under the channel lock.
//! A waiter is unlinked before it is resolved, resolved at most once, and
//! its task is woken only after the lock is released.
//!
//! Closing is one-way. Parked waiters are resumed with `ChannelClosed`,
//! buffered values are discarded, and every later operation fails with
//! `ChannelClosed` without suspending.
//!
//! `Channel` is the owning end and closes on drop. Tasks use cloned
//! `ChannelHandle`s, which never close anything, so a task parked on the
//! channel cannot keep it open after the owner is gone.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::outcome::ChannelClosed;

struct WaiterState<T> {
    /// Writer: the value waiting for delivery. Reader: the value delivered.
    value: Option<T>,
    /// Resume-once token: set exactly once, when the waiter is resumed.
    resolution: Option<Result<(), ChannelClosed>>,
    waker: Option<Waker>,
}

/// One parked read or write.
struct Waiter<T> {
    state: Mutex<WaiterState<T>>,
}

impl<T> Waiter<T> {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState {
                value: None,
                resolution: None,
                waker: Some(waker),
            }),
        })
    }

    /// Resume the waiter. Returns the waker to fire once the channel lock
    /// is released.
    ///
    /// Panics if the waiter was already resumed.
    fn resolve(&self, resolution: Result<(), ChannelClosed>, value: Option<T>) -> Option<Waker> {
        let mut state = self.state.lock();
        assert!(state.resolution.is_none(), "channel waiter resumed twice");
        state.resolution = Some(resolution);
        if value.is_some() {
            state.value = value;
        }
        state.waker.take()
    }

    fn park_value(&self, value: T) {
        self.state.lock().value = Some(value);
    }

    /// Take the value of a parked writer.
    fn take_value(&self) -> T {
        self.state
            .lock()
            .value
            .take()
            .expect("parked writer without a value")
    }

    fn is_resolved(&self) -> bool {
        self.state.lock().resolution.is_some()
    }

    /// Ready with the resolution (and delivered value, for readers) once
    /// resumed; otherwise refresh the waker.
    fn poll_resolution(&self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, ChannelClosed>> {
        let mut state = self.state.lock();
        match state.resolution {
            Some(Ok(())) => Poll::Ready(Ok(state.value.take())),
            Some(Err(closed)) => Poll::Ready(Err(closed)),
            None => {
                match state.waker.as_ref() {
                    Some(w) if w.will_wake(cx.waker()) => {}
                    _ => state.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

struct ChannelInner<T> {
    buffer: VecDeque<T>,
    readers: VecDeque<Arc<Waiter<T>>>,
    writers: VecDeque<Arc<Waiter<T>>>,
}

impl<T> ChannelInner<T> {
    fn check_invariants(&self, capacity: usize) {
        debug_assert!(self.buffer.len() <= capacity);
        debug_assert!(self.buffer.is_empty() || self.readers.is_empty());
        debug_assert!(self.writers.is_empty() || self.buffer.len() == capacity);
        debug_assert!(self.readers.is_empty() || self.writers.is_empty());
    }
}

fn wake_all(wakers: Vec<Option<Waker>>) {
    for waker in wakers.into_iter().flatten() {
        waker.wake();
    }
}

/// Owning end of a FIFO channel with a fixed buffer capacity.
///
/// Dropping it closes the channel. Hand `ChannelHandle`s to tasks.
pub struct Channel<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Channel<T> {
    /// A channel buffering up to `capacity` values. 0 makes it a rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            core: Arc::new(ChannelCore {
                capacity,
                active: AtomicBool::new(true),
                inner: Mutex::new(ChannelInner {
                    buffer: VecDeque::with_capacity(capacity.min(64)),
                    readers: VecDeque::new(),
                    writers: VecDeque::new(),
                }),
            }),
        }
    }

    /// A rendezvous channel: every write waits for a reader.
    pub fn rendezvous() -> Self {
        Self::new(0)
    }

    /// A channel whose writes never park.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// A non-owning handle for tasks to read and write through.
    pub fn handle(&self) -> ChannelHandle<T> {
        ChannelHandle {
            core: self.core.clone(),
        }
    }
}

impl<T> Deref for Channel<T> {
    type Target = ChannelCore<T>;

    fn deref(&self) -> &ChannelCore<T> {
        &self.core
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

/// Shared use of a channel. Dropping a handle leaves the channel open.
pub struct ChannelHandle<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for ChannelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> Deref for ChannelHandle<T> {
    type Target = ChannelCore<T>;

    fn deref(&self) -> &ChannelCore<T> {
        &self.core
    }
}

impl<T> fmt::Debug for ChannelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

/// Channel state and operations, reached through `Channel` or
/// `ChannelHandle`.
pub struct ChannelCore<T> {
    capacity: usize,
    active: AtomicBool,
    inner: Mutex<ChannelInner<T>>,
}

impl<T> ChannelCore<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Values currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parked_readers(&self) -> usize {
        self.inner.lock().readers.len()
    }

    pub fn parked_writers(&self) -> usize {
        self.inner.lock().writers.len()
    }

    /// Send `value`. The returned future resolves once the value has been
    /// handed to a reader or buffered.
    ///
    /// Whether the channel is open is checked on the first poll; a closed
    /// channel makes that poll return `ChannelClosed` without suspending.
    pub fn write(&self, value: T) -> WriteFuture<'_, T> {
        WriteFuture {
            channel: self,
            value: Some(value),
            waiter: None,
        }
    }

    /// Receive the oldest available value.
    ///
    /// As with `write`, a closed channel fails on the first poll without
    /// suspending.
    pub fn read(&self) -> ReadFuture<'_, T> {
        ReadFuture {
            channel: self,
            waiter: None,
        }
    }

    /// Receive into `slot`.
    pub async fn read_into(&self, slot: &mut T) -> Result<(), ChannelClosed> {
        *slot = self.read().await?;
        Ok(())
    }

    /// Close the channel. Only the first call does anything.
    pub fn close(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let (wakers, discarded) = {
            let mut inner = self.inner.lock();
            let mut wakers = Vec::with_capacity(inner.readers.len() + inner.writers.len());
            for writer in inner.writers.drain(..) {
                wakers.push(writer.resolve(Err(ChannelClosed), None));
            }
            for reader in inner.readers.drain(..) {
                wakers.push(reader.resolve(Err(ChannelClosed), None));
            }
            (wakers, std::mem::take(&mut inner.buffer))
        };
        debug!(
            resumed = wakers.len(),
            discarded = discarded.len(),
            "channel closed"
        );
        drop(discarded);
        wake_all(wakers);
    }

    /// Write protocol. `waiter` is resolved here unless it had to park.
    fn offer(&self, value: T, waiter: &Arc<Waiter<T>>) -> Result<(), ChannelClosed> {
        let mut wakers = Vec::with_capacity(2);
        {
            let mut inner = self.inner.lock();
            // Checked under the lock: a close that already flipped the flag
            // has not drained the lists yet, so parking here would be missed.
            if !self.is_active() {
                return Err(ChannelClosed);
            }

            if let Some(reader) = inner.readers.pop_front() {
                wakers.push(reader.resolve(Ok(()), Some(value)));
                wakers.push(waiter.resolve(Ok(()), None));
            } else if inner.buffer.len() < self.capacity {
                inner.buffer.push_back(value);
                wakers.push(waiter.resolve(Ok(()), None));
            } else {
                waiter.park_value(value);
                inner.writers.push_back(waiter.clone());
                trace!(parked = inner.writers.len(), "writer parked");
            }
            inner.check_invariants(self.capacity);
        }
        wake_all(wakers);
        Ok(())
    }

    /// Read protocol. `waiter` is resolved here unless it had to park.
    fn take(&self, waiter: &Arc<Waiter<T>>) -> Result<(), ChannelClosed> {
        let mut wakers = Vec::with_capacity(2);
        {
            let mut inner = self.inner.lock();
            if !self.is_active() {
                return Err(ChannelClosed);
            }

            if let Some(value) = inner.buffer.pop_front() {
                if let Some(writer) = inner.writers.pop_front() {
                    let refill = writer.take_value();
                    inner.buffer.push_back(refill);
                    wakers.push(writer.resolve(Ok(()), None));
                }
                wakers.push(waiter.resolve(Ok(()), Some(value)));
            } else if let Some(writer) = inner.writers.pop_front() {
                let value = writer.take_value();
                wakers.push(waiter.resolve(Ok(()), Some(value)));
                wakers.push(writer.resolve(Ok(()), None));
            } else {
                inner.readers.push_back(waiter.clone());
                trace!(parked = inner.readers.len(), "reader parked");
            }
            inner.check_invariants(self.capacity);
        }
        wake_all(wakers);
        Ok(())
    }

    /// Remove a still-parked waiter. Waiters are only resolved under the
    /// channel lock, so checking here cannot race a handoff.
    fn unlink_writer(&self, waiter: &Arc<Waiter<T>>) {
        let mut inner = self.inner.lock();
        if !waiter.is_resolved() {
            inner.writers.retain(|w| !Arc::ptr_eq(w, waiter));
        }
    }

    fn unlink_reader(&self, waiter: &Arc<Waiter<T>>) {
        let mut inner = self.inner.lock();
        if !waiter.is_resolved() {
            inner.readers.retain(|w| !Arc::ptr_eq(w, waiter));
        }
    }
}

impl<T> fmt::Debug for ChannelCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("active", &self.is_active())
            .field("buffered", &inner.buffer.len())
            .field("parked_readers", &inner.readers.len())
            .field("parked_writers", &inner.writers.len())
            .finish()
    }
}

/// Pending write. Created by `Channel::write`.
///
/// Always suspends at least once, even when the value can be delivered
/// right away; a channel found closed on the first poll fails without
/// suspending.
#[must_use = "futures do nothing unless awaited"]
pub struct WriteFuture<'a, T> {
    channel: &'a ChannelCore<T>,
    value: Option<T>,
    waiter: Option<Arc<Waiter<T>>>,
}

// `T` is moved, never pinned.
impl<T> Unpin for WriteFuture<'_, T> {}

impl<T> Future for WriteFuture<'_, T> {
    type Output = Result<(), ChannelClosed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(waiter) = &this.waiter {
            return waiter.poll_resolution(cx).map(|r| r.map(|_| ()));
        }

        let Some(value) = this.value.take() else {
            // Polled again after completing.
            return Poll::Ready(Ok(()));
        };
        let waiter = Waiter::new(cx.waker().clone());
        this.channel.offer(value, &waiter)?;
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for WriteFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(waiter) = &self.waiter {
            self.channel.unlink_writer(waiter);
        }
    }
}

/// Pending read. Created by `Channel::read`.
///
/// Always suspends at least once; a channel found closed on the first
/// poll fails without suspending.
#[must_use = "futures do nothing unless awaited"]
pub struct ReadFuture<'a, T> {
    channel: &'a ChannelCore<T>,
    waiter: Option<Arc<Waiter<T>>>,
}

impl<T> Unpin for ReadFuture<'_, T> {}

impl<T> Future for ReadFuture<'_, T> {
    type Output = Result<T, ChannelClosed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(waiter) = &this.waiter {
            return match waiter.poll_resolution(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Err(closed)) => Poll::Ready(Err(closed)),
                Poll::Ready(Ok(Some(value))) => Poll::Ready(Ok(value)),
                // Value already handed out by an earlier poll.
                Poll::Ready(Ok(None)) => Poll::Ready(Err(ChannelClosed)),
            };
        }

        let waiter = Waiter::new(cx.waker().clone());
        this.channel.take(&waiter)?;
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for ReadFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(waiter) = &self.waiter {
            self.channel.unlink_reader(waiter);
        }
    }
}
