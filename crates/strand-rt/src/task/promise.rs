// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Completion state shared by a task's body and its handles.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::outcome::Outcome;

pub(crate) type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct PromiseState<T> {
    result: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
}

/// Write-once result slot with blocking waiters and completion callbacks.
///
/// The lock is never held while a callback runs.
pub(crate) struct Promise<T> {
    state: Mutex<PromiseState<T>>,
    completion: Condvar,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PromiseState {
                result: None,
                callbacks: Vec::new(),
            }),
            completion: Condvar::new(),
        }
    }

    /// Settle the promise and drain callbacks on the calling thread.
    ///
    /// Panics if the promise was already settled. A panicking callback does
    /// not stop the rest; the first panic is re-raised after all have run.
    pub fn complete(&self, outcome: Outcome<T>) {
        let callbacks = {
            let mut state = self.state.lock();
            assert!(state.result.is_none(), "task completed twice");
            state.result = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.completion.notify_all();

        let mut first_panic = None;
        for callback in callbacks {
            let outcome = outcome.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            resume_unwind(payload);
        }
    }

    /// Register a callback. Runs right here if the promise is already settled.
    pub fn on_completed(&self, callback: Callback<T>) {
        let mut state = self.state.lock();
        match &state.result {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                callback(outcome);
            }
            None => state.callbacks.push(callback),
        }
    }

    /// Block until settled.
    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.result {
                return outcome.clone();
            }
            self.completion.wait(&mut state);
        }
    }

    /// Block until settled or until `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.result {
                return Some(outcome.clone());
            }
            if self.completion.wait_until(&mut state, deadline).timed_out() {
                return state.result.clone();
            }
        }
    }

    pub fn peek(&self) -> Option<Outcome<T>> {
        self.state.lock().result.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }
}
