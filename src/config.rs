//! Scheduler configuration
//!
//! Every scheduler backend of this crate is built from a `SchedulerConfig`.
//! Configurations start from sensible defaults, can be adjusted
//! programmatically through the `with_*` setters, and can also pick up
//! overrides from the following environment variables:
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `ASYNC_OPS_THREAD_NAME_PREFIX` | string | `thread_name_prefix` |
//! | `ASYNC_OPS_MIN_THREADS` | unsigned integer | `min_threads` |
//! | `ASYNC_OPS_MAX_THREADS` | unsigned integer | `max_threads` |
//! | `ASYNC_OPS_IDLE_TIMEOUT_MS` | milliseconds | `idle_timeout` |
//! | `ASYNC_OPS_EVENT_LOOP_THREADS` | unsigned integer | `event_loop_threads` |
//! | `ASYNC_OPS_GRACE_PERIOD_MS` | milliseconds | `grace_period` |
//! | `ASYNC_OPS_HARD_TIMEOUT_MS` | milliseconds | `hard_timeout` |

use std::thread;
use std::time::Duration;

use thiserror::Error;


/// Environment variable name for the thread name prefix
pub const ENV_THREAD_NAME_PREFIX: &str = "ASYNC_OPS_THREAD_NAME_PREFIX";
/// Environment variable name for the minimal thread pool size
pub const ENV_MIN_THREADS: &str = "ASYNC_OPS_MIN_THREADS";
/// Environment variable name for the maximal thread pool size
pub const ENV_MAX_THREADS: &str = "ASYNC_OPS_MAX_THREADS";
/// Environment variable name for the idle timeout of excess pool threads
pub const ENV_IDLE_TIMEOUT_MS: &str = "ASYNC_OPS_IDLE_TIMEOUT_MS";
/// Environment variable name for the number of event loops
pub const ENV_EVENT_LOOP_THREADS: &str = "ASYNC_OPS_EVENT_LOOP_THREADS";
/// Environment variable name for the shutdown grace period
pub const ENV_GRACE_PERIOD_MS: &str = "ASYNC_OPS_GRACE_PERIOD_MS";
/// Environment variable name for the shutdown hard timeout
pub const ENV_HARD_TIMEOUT_MS: &str = "ASYNC_OPS_HARD_TIMEOUT_MS";


/// Invalid scheduler configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is set to something which cannot be parsed
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// Name of the offending variable
        var: &'static str,
        /// What the variable should have contained
        expected: &'static str,
        /// What it actually contained
        value: String,
    },

    /// The thread pool cannot have zero threads
    #[error("max_threads must be at least 1")]
    NoThreads,

    /// The thread pool bounds are inverted
    #[error("min_threads ({min}) exceeds max_threads ({max})")]
    InvertedBounds {
        /// Requested minimal pool size
        min: usize,
        /// Requested maximal pool size
        max: usize,
    },

    /// An event-loop scheduler needs at least one loop
    #[error("event_loop_threads must be at least 1")]
    NoEventLoops,
}


/// Parameters of the scheduler backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Prefix of the names given to every thread spawned by a scheduler
    pub thread_name_prefix: String,

    /// Number of pool threads which are kept alive even when idle
    pub min_threads: usize,

    /// Upper bound on the number of pool threads
    pub max_threads: usize,

    /// Time after which idle pool threads above the minimum retire
    pub idle_timeout: Duration,

    /// Number of single-threaded reactors of an event-loop scheduler
    pub event_loop_threads: usize,

    /// Time given to already submitted work to finish on shutdown
    pub grace_period: Duration,

    /// Time given to threads to terminate after the grace period
    pub hard_timeout: Duration,
}
//
impl SchedulerConfig {
    /// Set the prefix of scheduler thread names
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the minimal thread pool size
    pub fn with_min_threads(mut self, min_threads: usize) -> Self {
        self.min_threads = min_threads;
        self
    }

    /// Set the maximal thread pool size
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the idle timeout of excess pool threads
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the number of event loops
    pub fn with_event_loop_threads(mut self, event_loop_threads: usize) -> Self {
        self.event_loop_threads = event_loop_threads;
        self
    }

    /// Set the shutdown grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the shutdown hard timeout
    pub fn with_hard_timeout(mut self, hard_timeout: Duration) -> Self {
        self.hard_timeout = hard_timeout;
        self
    }

    /// Check that the configuration describes a usable scheduler
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.min_threads > self.max_threads {
            return Err(ConfigError::InvertedBounds {
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        if self.event_loop_threads == 0 {
            return Err(ConfigError::NoEventLoops);
        }
        Ok(())
    }

    /// Default configuration, with overrides from the environment applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to this configuration
    ///
    /// Only variables that are set in the environment are applied. The
    /// result is not validated, since further adjustments may follow.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = read_env(ENV_MIN_THREADS) {
            self.min_threads = parse_usize(ENV_MIN_THREADS, &val)?;
        }
        if let Some(val) = read_env(ENV_MAX_THREADS) {
            self.max_threads = parse_usize(ENV_MAX_THREADS, &val)?;
        }
        if let Some(val) = read_env(ENV_IDLE_TIMEOUT_MS) {
            self.idle_timeout = parse_millis(ENV_IDLE_TIMEOUT_MS, &val)?;
        }
        if let Some(val) = read_env(ENV_EVENT_LOOP_THREADS) {
            self.event_loop_threads = parse_usize(ENV_EVENT_LOOP_THREADS, &val)?;
        }
        if let Some(val) = read_env(ENV_GRACE_PERIOD_MS) {
            self.grace_period = parse_millis(ENV_GRACE_PERIOD_MS, &val)?;
        }
        if let Some(val) = read_env(ENV_HARD_TIMEOUT_MS) {
            self.hard_timeout = parse_millis(ENV_HARD_TIMEOUT_MS, &val)?;
        }
        Ok(())
    }
}
//
impl Default for SchedulerConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(1, |n| n.get());
        SchedulerConfig {
            thread_name_prefix: "async-ops".to_owned(),
            min_threads: 1,
            max_threads: 4 * parallelism.max(16),
            idle_timeout: Duration::from_secs(60),
            event_loop_threads: parallelism,
            grace_period: Duration::from_secs(2),
            hard_timeout: Duration::from_secs(5),
        }
    }
}


/// Read an environment variable, returning `None` if unset
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Parse an unsigned integer from an environment variable
fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "unsigned integer",
        value: val.to_owned(),
    })
}

/// Parse a duration in milliseconds from an environment variable
fn parse_millis(var: &'static str, val: &str) -> Result<Duration, ConfigError> {
    val.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
        ConfigError::InvalidEnv {
            var,
            expected: "duration in milliseconds",
            value: val.to_owned(),
        }
    })
}
