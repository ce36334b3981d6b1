// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tunables for reconciliation passes.

use std::time::Duration;

/// Prefix of every instance sync lock key; the infrastructure mapping id is appended.
pub const INSTANCE_SYNC_LOCK_PREFIX: &str = "INSTANCE_SYNC:";

/// Configuration shared by the coordinator and the ledger.
#[derive(Debug, Clone)]
pub struct InstanceSyncConfig {
    /// Maximum time a pass may hold the per-mapping lock.
    pub lock_hold_timeout: Duration,
    /// Maximum time a pass waits for the per-mapping lock.
    pub lock_wait_timeout: Duration,
    /// Attempts for an event-driven pass (the first run included).
    pub new_deployment_attempts: u32,
    /// Deployment infos unseen for this long are dropped from the ledger.
    pub deployment_info_staleness: Duration,
    /// Ledger entries whose last successful run is older than this are deleted.
    pub failing_cleanup_after: Duration,
    /// How long an ingested deployment summary stays in the in-process cache.
    pub summary_cache_ttl: Duration,
    /// Upper bound on cached deployment summaries.
    pub summary_cache_capacity: usize,
    /// A poll payload with at least this many instances is treated as truncated.
    pub max_instances_per_entry: usize,
    /// A poll payload with at least this many sync keys is treated as truncated.
    pub max_releases_per_entry: usize,
    /// Global switch for the batched (V2) perpetual task protocol.
    pub batched_protocol_enabled: bool,
}

impl Default for InstanceSyncConfig {
    fn default() -> Self {
        Self {
            lock_hold_timeout: Duration::from_secs(200),
            lock_wait_timeout: Duration::from_secs(220),
            new_deployment_attempts: 3,
            deployment_info_staleness: Duration::from_secs(14 * 24 * 3600), // 2 weeks
            failing_cleanup_after: Duration::from_secs(7 * 24 * 3600),      // 1 week
            summary_cache_ttl: Duration::from_secs(600),
            summary_cache_capacity: 1000,
            max_instances_per_entry: 1000,
            max_releases_per_entry: 100,
            batched_protocol_enabled: true,
        }
    }
}

impl InstanceSyncConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `INSTANCE_SYNC_LOCK_TIMEOUT_SECS` (default: 200)
    /// - `INSTANCE_SYNC_LOCK_WAIT_SECS` (default: 220)
    /// - `INSTANCE_SYNC_NEW_DEPLOYMENT_ATTEMPTS` (default: 3)
    /// - `INSTANCE_SYNC_STALENESS_DAYS` (default: 14)
    /// - `INSTANCE_SYNC_FAILING_CLEANUP_DAYS` (default: 7)
    /// - `INSTANCE_SYNC_SUMMARY_CACHE_TTL_SECS` (default: 600)
    /// - `INSTANCE_SYNC_SUMMARY_CACHE_CAPACITY` (default: 1000)
    /// - `INSTANCE_SYNC_MAX_INSTANCES_PER_ENTRY` (default: 1000)
    /// - `INSTANCE_SYNC_MAX_RELEASES_PER_ENTRY` (default: 100)
    /// - `INSTANCE_SYNC_V2_ENABLED`: "true" or "1" (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let days = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .and_then(|d| d.checked_mul(24 * 3600))
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let count = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(default)
        };

        Self {
            lock_hold_timeout: secs("INSTANCE_SYNC_LOCK_TIMEOUT_SECS", defaults.lock_hold_timeout),
            lock_wait_timeout: secs("INSTANCE_SYNC_LOCK_WAIT_SECS", defaults.lock_wait_timeout),
            new_deployment_attempts: std::env::var("INSTANCE_SYNC_NEW_DEPLOYMENT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.new_deployment_attempts),
            deployment_info_staleness: days(
                "INSTANCE_SYNC_STALENESS_DAYS",
                defaults.deployment_info_staleness,
            ),
            failing_cleanup_after: days(
                "INSTANCE_SYNC_FAILING_CLEANUP_DAYS",
                defaults.failing_cleanup_after,
            ),
            summary_cache_ttl: secs(
                "INSTANCE_SYNC_SUMMARY_CACHE_TTL_SECS",
                defaults.summary_cache_ttl,
            ),
            summary_cache_capacity: count(
                "INSTANCE_SYNC_SUMMARY_CACHE_CAPACITY",
                defaults.summary_cache_capacity,
            ),
            max_instances_per_entry: count(
                "INSTANCE_SYNC_MAX_INSTANCES_PER_ENTRY",
                defaults.max_instances_per_entry,
            ),
            max_releases_per_entry: count(
                "INSTANCE_SYNC_MAX_RELEASES_PER_ENTRY",
                defaults.max_releases_per_entry,
            ),
            batched_protocol_enabled: std::env::var("INSTANCE_SYNC_V2_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.batched_protocol_enabled),
        }
    }

    /// Lock key guarding all passes for one infrastructure mapping.
    pub fn lock_key(&self, infrastructure_mapping_id: &str) -> String {
        format!("{}{}", INSTANCE_SYNC_LOCK_PREFIX, infrastructure_mapping_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Sets env vars for one test and restores them on drop.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_default() {
        let config = InstanceSyncConfig::default();
        assert_eq!(config.lock_hold_timeout, Duration::from_secs(200));
        assert_eq!(config.lock_wait_timeout, Duration::from_secs(220));
        assert_eq!(config.new_deployment_attempts, 3);
        assert_eq!(config.deployment_info_staleness.as_secs() / 86400, 14);
        assert_eq!(config.failing_cleanup_after.as_secs() / 86400, 7);
    }

    #[test]
    fn test_lock_key() {
        let config = InstanceSyncConfig::default();
        assert_eq!(config.lock_key("im-42"), "INSTANCE_SYNC:im-42");
    }

    #[test]
    fn test_from_env_reads_day_windows() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("INSTANCE_SYNC_STALENESS_DAYS", "3");
        guard.set("INSTANCE_SYNC_FAILING_CLEANUP_DAYS", "1");

        let config = InstanceSyncConfig::from_env();
        assert_eq!(config.deployment_info_staleness, Duration::from_secs(3 * 86400));
        assert_eq!(config.failing_cleanup_after, Duration::from_secs(86400));
    }

    #[test]
    fn test_from_env_overflowing_days_fall_back_to_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("INSTANCE_SYNC_STALENESS_DAYS", &u64::MAX.to_string());
        guard.set("INSTANCE_SYNC_FAILING_CLEANUP_DAYS", "not-a-number");

        let config = InstanceSyncConfig::from_env();
        let defaults = InstanceSyncConfig::default();
        assert_eq!(config.deployment_info_staleness, defaults.deployment_info_staleness);
        assert_eq!(config.failing_cleanup_after, defaults.failing_cleanup_after);
    }
}
