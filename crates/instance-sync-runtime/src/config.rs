// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the instance sync runtime.

use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of dispatcher workers running passes concurrently.
    pub worker_count: usize,
    /// Requests buffered before `submit` starts waiting.
    pub queue_capacity: usize,
    /// Whether the periodic ledger sweep runs.
    pub sweep_enabled: bool,
    /// Time between ledger sweeps.
    pub sweep_interval: Duration,
    /// Ledger entries loaded per sweep page.
    pub sweep_batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            sweep_enabled: true,
            sweep_interval: Duration::from_secs(3600), // 1 hour
            sweep_batch_size: 100,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `INSTANCE_SYNC_RUNTIME_WORKERS`: dispatcher workers (default: 4)
    /// - `INSTANCE_SYNC_RUNTIME_QUEUE_CAPACITY`: buffered requests (default: 256)
    /// - `INSTANCE_SYNC_RUNTIME_SWEEP_ENABLED`: "true" or "1" to enable (default: true)
    /// - `INSTANCE_SYNC_RUNTIME_SWEEP_INTERVAL_SECS`: seconds between sweeps (default: 3600)
    /// - `INSTANCE_SYNC_RUNTIME_SWEEP_BATCH_SIZE`: entries per sweep page (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let sweep_enabled = std::env::var("INSTANCE_SYNC_RUNTIME_SWEEP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.sweep_enabled);

        let config = Self {
            worker_count: parse_var("INSTANCE_SYNC_RUNTIME_WORKERS", defaults.worker_count)?,
            queue_capacity: parse_var(
                "INSTANCE_SYNC_RUNTIME_QUEUE_CAPACITY",
                defaults.queue_capacity,
            )?,
            sweep_enabled,
            sweep_interval: Duration::from_secs(parse_var(
                "INSTANCE_SYNC_RUNTIME_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            sweep_batch_size: parse_var(
                "INSTANCE_SYNC_RUNTIME_SWEEP_BATCH_SIZE",
                defaults.sweep_batch_size,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Zero("INSTANCE_SYNC_RUNTIME_WORKERS"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("INSTANCE_SYNC_RUNTIME_QUEUE_CAPACITY"));
        }
        if self.sweep_batch_size == 0 {
            return Err(ConfigError::Zero("INSTANCE_SYNC_RUNTIME_SWEEP_BATCH_SIZE"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
    /// A count that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = RuntimeConfig {
            worker_count: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("INSTANCE_SYNC_RUNTIME_WORKERS"))
        );
    }

    #[test]
    fn test_parse_var_falls_back_to_default() {
        let value: usize = parse_var("INSTANCE_SYNC_RUNTIME_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
