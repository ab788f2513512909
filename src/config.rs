//! Plain-data engine options.
//!
//! [`EngineOptions`] covers every setting that can come from a configuration file. Collaborators
//! that cannot (sink, hooks, custom queue or policy) are wired on the
//! [`EngineBuilder`](crate::engine::EngineBuilder). With the `serde` feature the options
//! deserialize from any serde format; missing fields take their defaults.
//!
//! ```rust
//! use spool::config::EngineOptions;
//!
//! let options = EngineOptions { queue_capacity: 64, ..EngineOptions::default() };
//! assert!(options.validate().is_ok());
//! assert!(options.asynchronous);
//! ```

use crate::error::ConfigError;
use crate::record::FixFlags;
use std::time::Duration;

/// Options consumed by [`EngineBuilder::options`](crate::engine::EngineBuilder::options).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default, deny_unknown_fields))]
pub struct EngineOptions {
    /// Name used in diagnostics and `tracing` fields.
    pub name: String,
    /// Queue formatted events and deliver them from a background task.
    pub asynchronous: bool,
    /// Volatile record fields to snapshot before queuing.
    pub fix: FixFlags,
    /// Events the default in-memory queue buffers before rejecting.
    pub queue_capacity: usize,
    /// Largest batch handed to the sink at once.
    pub max_batch_size: usize,
    /// How long `close` waits for the delivery task to drain.
    #[cfg_attr(feature = "serde", serde(rename = "shutdown_timeout_ms", with = "millis"))]
    pub shutdown_timeout: Duration,
    /// Constant delay between retries; negative disables retries.
    pub retry_delay_ms: i64,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "spool".to_string(),
            asynchronous: true,
            fix: FixFlags::ALL,
            queue_capacity: 1024,
            max_batch_size: 512,
            shutdown_timeout: Duration::from_secs(5),
            retry_delay_ms: 1000,
            max_retries: 3,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("max_batch_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
