//! TOML-backed runtime configuration. Every knob has a default, so
//! a minimal file only names the database.

use serde::Deserialize;
use std::time::Duration;

use crate::idempotency::LockTtls;
use crate::runner::CatchUpOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite connection string for the checkpoint database.
    pub database_url: String,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub runner: RunnerSection,

    #[serde(default)]
    pub locks: LockSection,

    #[serde(default)]
    pub hints: HintSection,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn runner_options(&self) -> CatchUpOptions {
        CatchUpOptions {
            prefixes: self.runner.prefixes.clone(),
            batch_size: self.runner.batch_size,
            checkpoint_interval: self.runner.checkpoint_interval,
            max_retries: self.runner.max_retries,
            retry_delay: Duration::from_millis(self.runner.retry_delay_ms),
            idle_poll_interval: Duration::from_millis(self.runner.idle_poll_interval_ms),
            stop_when_caught_up: self.runner.stop_when_caught_up,
        }
    }

    pub fn lock_ttls(&self) -> LockTtls {
        LockTtls {
            dispatch: Duration::from_secs(self.locks.dispatch_ttl_secs),
            execute: Duration::from_secs(self.locks.execute_ttl_secs),
        }
    }

    pub fn hint_ttl(&self) -> Duration {
        Duration::from_secs(self.hints.ttl_secs)
    }

    /// Deadline for each event store call, applied through
    /// [`crate::store::TimeoutStore`].
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub op_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            op_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub prefixes: Vec<String>,
    pub batch_size: usize,
    pub checkpoint_interval: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub idle_poll_interval_ms: u64,
    pub stop_when_caught_up: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        let defaults = CatchUpOptions::default();
        Self {
            prefixes: defaults.prefixes,
            batch_size: defaults.batch_size,
            checkpoint_interval: defaults.checkpoint_interval,
            max_retries: defaults.max_retries,
            retry_delay_ms: u64::try_from(defaults.retry_delay.as_millis())
                .unwrap_or(u64::MAX),
            idle_poll_interval_ms: u64::try_from(defaults.idle_poll_interval.as_millis())
                .unwrap_or(u64::MAX),
            stop_when_caught_up: defaults.stop_when_caught_up,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub dispatch_ttl_secs: u64,
    pub execute_ttl_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        let defaults = LockTtls::default();
        Self {
            dispatch_ttl_secs: defaults.dispatch.as_secs(),
            execute_ttl_secs: defaults.execute.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HintSection {
    pub ttl_secs: u64,
}

impl Default for HintSection {
    fn default() -> Self {
        Self { ttl_secs: 600 }
    }
}
