//! Runtime configuration.
//!
//! A [`Config`] is passed to [`hyphae::init`](crate::init). It can be built
//! programmatically or read from the environment with [`Config::from_env`].
use crate::sleep::SyncPolicy;
use std::{env, fmt, num::ParseIntError};

/// Configures a runtime.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) max_tasks: usize,
    pub(crate) sync_policy: SyncPolicy,
    pub(crate) yield_iters: Option<usize>,
    pub(crate) auto_rounds: usize,
    pub(crate) stack_wait_rounds: usize,
}

/// An error parsing a configuration value from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// An environment variable did not name a synchronization policy.
    #[error("{var}: unknown synchronization policy {value:?} (expected busywait, yield, blocking or auto)")]
    SyncPolicy {
        /// The variable that was read.
        var: &'static str,
        /// The value that failed to parse.
        value: String,
    },

    /// An environment variable did not hold a number.
    #[error("{var}: expected a number")]
    Number {
        /// The variable that was read.
        var: &'static str,
        /// The underlying parse error.
        #[source]
        source: ParseIntError,
    },
}

impl Config {
    /// Environment variable selecting the default [`SyncPolicy`].
    pub const ENV_SYNC: &'static str = "HYPHAE_SYNC";
    /// Environment variable overriding [`Config::max_tasks`].
    pub const ENV_MAX_TASKS: &'static str = "HYPHAE_MAX_TASKS";
    /// Environment variable overriding [`Config::yield_iters`].
    pub const ENV_YIELD_ITERS: &'static str = "HYPHAE_YIELD_ITERS";

    /// The default number of task slots, including the root task.
    pub const DEFAULT_MAX_TASKS: usize = 256;
    /// The default number of spin/yield rounds before [`SyncPolicy::Auto`]
    /// falls back to blocking.
    pub const DEFAULT_AUTO_ROUNDS: usize = 100;
    /// The default number of OS-level yield rounds the stack-protection wait
    /// will tolerate before declaring a deadlock.
    pub const DEFAULT_STACK_WAIT_ROUNDS: usize = 1000;

    /// Returns a configuration with the default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_tasks: Self::DEFAULT_MAX_TASKS,
            sync_policy: SyncPolicy::Auto,
            yield_iters: None,
            auto_rounds: Self::DEFAULT_AUTO_ROUNDS,
            stack_wait_rounds: Self::DEFAULT_STACK_WAIT_ROUNDS,
        }
    }

    /// Returns the default configuration, overridden by any `HYPHAE_*`
    /// environment variables that are set.
    pub fn from_env() -> Result<Self, ParseError> {
        Self::new().with_env()
    }

    /// Overrides this configuration with any `HYPHAE_*` environment variables
    /// that are set.
    pub fn with_env(mut self) -> Result<Self, ParseError> {
        if let Some(value) = var(Self::ENV_SYNC) {
            self.sync_policy = value.parse().map_err(|_| ParseError::SyncPolicy {
                var: Self::ENV_SYNC,
                value,
            })?;
        }

        if let Some(value) = var(Self::ENV_MAX_TASKS) {
            self.max_tasks = parse_number(Self::ENV_MAX_TASKS, &value)?;
        }

        if let Some(value) = var(Self::ENV_YIELD_ITERS) {
            self.yield_iters = Some(parse_number(Self::ENV_YIELD_ITERS, &value)?);
        }

        tracing::debug!(config = ?self, "read configuration from environment");
        Ok(self)
    }

    /// Sets the number of task slots, including the root task.
    #[must_use]
    pub fn max_tasks(self, max_tasks: usize) -> Self {
        Self { max_tasks, ..self }
    }

    /// Sets the default synchronization policy of new scheduling domains.
    #[must_use]
    pub fn sync_policy(self, sync_policy: SyncPolicy) -> Self {
        Self {
            sync_policy,
            ..self
        }
    }

    /// Sets the number of pause instructions equivalent to one OS-level yield.
    ///
    /// When unset, this is calibrated when the runtime starts.
    #[must_use]
    pub fn yield_iters(self, iters: usize) -> Self {
        Self {
            yield_iters: Some(iters),
            ..self
        }
    }

    /// Sets how many spin/yield rounds [`SyncPolicy::Auto`] performs before it
    /// blocks.
    #[must_use]
    pub fn auto_rounds(self, auto_rounds: usize) -> Self {
        Self {
            auto_rounds,
            ..self
        }
    }

    /// Sets how many OS-level yield rounds the stack-protection wait tolerates
    /// before the runtime aborts.
    #[must_use]
    pub fn stack_wait_rounds(self, stack_wait_rounds: usize) -> Self {
        Self {
            stack_wait_rounds,
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_tasks={} sync={} auto_rounds={} stack_wait_rounds={}",
            self.max_tasks, self.sync_policy, self.auto_rounds, self.stack_wait_rounds
        )?;
        match self.yield_iters {
            Some(iters) => write!(f, " yield_iters={iters}"),
            None => f.write_str(" yield_iters=calibrated"),
        }
    }
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number(var: &'static str, value: &str) -> Result<usize, ParseError> {
    value
        .trim()
        .parse()
        .map_err(|source| ParseError::Number { var, source })
}
