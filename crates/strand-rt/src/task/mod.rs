// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspendable tasks.
//!
//! `handle` is the public face (spawn, block on, chain callbacks, await),
//! `promise` holds the outcome, `raw` drives the body future through its
//! executor, and `awaiter` has the suspension points a body can await.

mod awaiter;
mod handle;
mod promise;
mod raw;

pub use awaiter::{dispatch, sleep, yield_now, Dispatch, SleepAwaiter, TaskAwaiter};
pub use handle::{CallbackPolicy, Launch, Task, TaskBuilder, UnknownPolicy};
pub use raw::TaskId;
