// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task outcomes and the runtime's error taxonomy.
//!
//! An `Outcome<T>` is what a finished task leaves behind: either the value
//! its body produced or the failure that stopped it. Outcomes are cloned
//! out to every consumer (blocking getters, callbacks, awaiting tasks), so
//! failures are cheap to clone.

use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// A channel operation was attempted on, or interrupted by, a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel is closed")]
pub struct ChannelClosed;

/// Why a task did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The body panicked while being polled.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The body gave up because a channel it used was closed.
    #[error(transparent)]
    ChannelClosed(#[from] ChannelClosed),

    /// The body returned an application error.
    #[error("{0}")]
    Failed(Arc<dyn StdError + Send + Sync>),
}

impl TaskError {
    /// Wrap any error (or a plain message) as a task failure.
    pub fn failed(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        TaskError::Failed(Arc::from(err.into()))
    }

    /// Build a `Panicked` failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        TaskError::Panicked(panic_message(payload.as_ref()))
    }

    pub fn is_channel_closed(&self) -> bool {
        matches!(self, TaskError::ChannelClosed(_))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The settled result of a task: a value or a captured failure.
///
/// `Outcome<()>` is the "no value" form; its success side carries nothing.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Value(T),
    Failure(TaskError),
}

impl<T> Outcome<T> {
    /// Yield the value, or hand back the captured failure.
    pub fn get_or_throw(self) -> Result<T, TaskError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Failure(e) => Err(e),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskError> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Failure(e) => Some(e),
        }
    }
}

impl<T, E: Into<TaskError>> From<Result<T, E>> for Outcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}
