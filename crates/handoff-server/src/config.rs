//! Server configuration
//!
//! Library defaults with runtime environment overrides; the command line
//! layers on top through the builder setters.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Command-line flags (applied by the binary through the setters)
//! 2. Environment variables
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use handoff_server::config::ServerConfig;
//!
//! let config = ServerConfig::from_env()?
//!     .port(4000)
//!     .queue_capacity(256);
//! config.validate()?;
//! ```

use std::str::FromStr;

use handoff_core::MAX_CAPACITY;

use crate::error::ConfigError;

/// Compile-time defaults.
pub mod defaults {
    pub const PORT: u16 = 1234;
    pub const BACKLOG: u32 = 1024;
    pub const QUEUE_CAPACITY: usize = 1024;
    pub const DRAIN_BATCH: usize = 64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP port to listen on; 0 picks an ephemeral port
    pub port: u16,
    /// listen(2) backlog
    pub backlog: u32,
    /// Slots per hand-off queue (power of two, at most 1024)
    pub queue_capacity: usize,
    /// Most items a stage takes off its inbound queue per wake
    pub drain_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::PORT,
            backlog: defaults::BACKLOG,
            queue_capacity: defaults::QUEUE_CAPACITY,
            drain_batch: defaults::DRAIN_BATCH,
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `HANDOFF_PORT` - listen port
    /// - `HANDOFF_BACKLOG` - listen backlog
    /// - `HANDOFF_QUEUE_CAPACITY` - slots per hand-off queue
    /// - `HANDOFF_DRAIN_BATCH` - items drained per wake
    ///
    /// A variable that is set but does not parse is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_override("HANDOFF_PORT", defaults::PORT)?,
            backlog: env_override("HANDOFF_BACKLOG", defaults::BACKLOG)?,
            queue_capacity: env_override("HANDOFF_QUEUE_CAPACITY", defaults::QUEUE_CAPACITY)?,
            drain_batch: env_override("HANDOFF_DRAIN_BATCH", defaults::DRAIN_BATCH)?,
        })
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn drain_batch(mut self, batch: usize) -> Self {
        self.drain_batch = batch;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cap = self.queue_capacity;
        if cap == 0 || cap > MAX_CAPACITY || !cap.is_power_of_two() {
            return Err(ConfigError::QueueCapacity(cap));
        }
        if self.backlog == 0 {
            return Err(ConfigError::Backlog);
        }
        if self.drain_batch == 0 {
            return Err(ConfigError::DrainBatch);
        }
        Ok(())
    }
}

fn env_override<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 1234);
        assert_eq!(c.backlog, 1024);
        assert_eq!(c.queue_capacity, 1024);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_queue_capacity() {
        for bad in [0usize, 3, 1000, 2048] {
            assert_eq!(
                ServerConfig::default().queue_capacity(bad).validate(),
                Err(ConfigError::QueueCapacity(bad))
            );
        }
        for good in [1usize, 2, 512, 1024] {
            assert!(ServerConfig::default().queue_capacity(good).validate().is_ok());
        }
    }

    #[test]
    fn test_validate_backlog_and_batch() {
        assert_eq!(ServerConfig::default().backlog(0).validate(), Err(ConfigError::Backlog));
        assert_eq!(ServerConfig::default().drain_batch(0).validate(), Err(ConfigError::DrainBatch));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("__HANDOFF_TEST_NUM__", "512");
        assert_eq!(env_override("__HANDOFF_TEST_NUM__", 0usize), Ok(512));

        std::env::set_var("__HANDOFF_TEST_NUM__", "70000");
        assert_eq!(
            env_override::<u16>("__HANDOFF_TEST_NUM__", 1),
            Err(ConfigError::Env { key: "__HANDOFF_TEST_NUM__", value: "70000".into() })
        );
        std::env::remove_var("__HANDOFF_TEST_NUM__");

        assert_eq!(env_override("__HANDOFF_TEST_UNSET__", 7u32), Ok(7));
    }
}
