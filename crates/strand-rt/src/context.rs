// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime context: the executor, delay scheduler and task defaults a
//! program hands to the code that spawns tasks.
//!
//! There is no global runtime. Driver programs build one `RuntimeContext`
//! (usually from `RuntimeConfig::from_env`) and pass it down.

use std::env;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::executor::{Executor, ExecutorKind, UnknownExecutor};
use crate::outcome::TaskError;
use crate::task::{CallbackPolicy, Launch, Task, TaskBuilder, UnknownPolicy};
use crate::timer::DelayScheduler;

/// Environment variable selecting the executor kind.
pub const EXECUTOR_VAR: &str = "STRAND_EXECUTOR";
/// Environment variable selecting the `then` panic policy.
pub const CALLBACK_POLICY_VAR: &str = "STRAND_CALLBACK_POLICY";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("STRAND_EXECUTOR: {0}")]
    Executor(#[from] UnknownExecutor),
    #[error("STRAND_CALLBACK_POLICY: {0}")]
    CallbackPolicy(#[from] UnknownPolicy),
}

/// Task defaults for a runtime context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub executor: ExecutorKind,
    pub callback_policy: CallbackPolicy,
    pub launch: Launch,
}

impl RuntimeConfig {
    /// Defaults overridden by `STRAND_EXECUTOR` and
    /// `STRAND_CALLBACK_POLICY`. Unset or empty variables keep the default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(EXECUTOR_VAR).filter(|v| !v.trim().is_empty()) {
            config.executor = raw.parse()?;
        }
        if let Some(raw) = lookup(CALLBACK_POLICY_VAR).filter(|v| !v.trim().is_empty()) {
            config.callback_policy = raw.parse()?;
        }
        Ok(config)
    }
}

/// Executor plus delay scheduler plus task defaults.
pub struct RuntimeContext {
    executor: Arc<dyn Executor>,
    timer: Arc<DelayScheduler>,
    callback_policy: CallbackPolicy,
    launch: Launch,
}

impl RuntimeContext {
    /// Build the configured executor; sleeps go through the shared delay
    /// scheduler.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_timer(config, DelayScheduler::shared())
    }

    pub fn with_timer(config: RuntimeConfig, timer: Arc<DelayScheduler>) -> Self {
        debug!(
            executor = %config.executor,
            policy = ?config.callback_policy,
            launch = ?config.launch,
            "runtime context created"
        );
        Self {
            executor: config.executor.build(),
            timer,
            callback_policy: config.callback_policy,
            launch: config.launch,
        }
    }

    /// Use an already-built executor.
    pub fn from_parts(
        executor: Arc<dyn Executor>,
        timer: Arc<DelayScheduler>,
        callback_policy: CallbackPolicy,
        launch: Launch,
    ) -> Self {
        Self {
            executor,
            timer,
            callback_policy,
            launch,
        }
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    pub fn timer(&self) -> Arc<DelayScheduler> {
        self.timer.clone()
    }

    /// A builder preloaded with this context's executor and defaults.
    pub fn builder(&self) -> TaskBuilder {
        TaskBuilder::new()
            .executor(self.executor.clone())
            .timer(self.timer.clone())
            .callback_policy(self.callback_policy)
            .launch(self.launch)
    }

    pub fn spawn<T, F, E>(&self, body: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<TaskError> + 'static,
    {
        self.builder().spawn(body)
    }

    /// Spawn with a different launch policy than the context default.
    pub fn spawn_with<T, F, E>(&self, launch: Launch, body: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<TaskError> + 'static,
    {
        self.builder().launch(launch).spawn(body)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("timer", &self.timer)
            .field("callback_policy", &self.callback_policy)
            .field("launch", &self.launch)
            .finish_non_exhaustive()
    }
}
