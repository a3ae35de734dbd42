// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: cooperative tasks and channels over pluggable executors.
//!
//! A task is an `async` body plus an executor. The body runs until it
//! awaits something (another task, a sleep, a channel operation, an
//! explicit `dispatch`), and every resumption is handed back to the task's
//! own executor. Callers block on results with `get_result`, chain
//! `then`/`catching`/`finally` callbacks, or `.await` one task from another.
//!
//! Components:
//! - outcome: task results and the error taxonomy
//! - executor: inline, new-thread, pooled and looper strategies
//! - timer: delay scheduler backing `sleep`
//! - task: task handles, builder and suspension points
//! - channel: bounded and rendezvous channels with parking
//! - context: runtime configuration and the injected context

pub mod channel;
pub mod context;
pub mod executor;
pub mod outcome;
pub mod task;
pub mod timer;

#[cfg(test)]
mod test_utils;

pub use channel::{Channel, ChannelCore, ChannelHandle, ReadFuture, WriteFuture};
pub use context::{ConfigError, RuntimeConfig, RuntimeContext};
pub use executor::{
    Executor, ExecutorKind, InlineExecutor, LooperExecutor, NewThreadExecutor, PooledExecutor,
    SharedLooperExecutor,
};
pub use outcome::{ChannelClosed, Outcome, TaskError};
pub use task::{dispatch, sleep, yield_now, CallbackPolicy, Launch, Task, TaskBuilder};
pub use timer::DelayScheduler;
