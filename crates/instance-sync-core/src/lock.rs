// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutual exclusion per infrastructure mapping.
//!
//! Locks are leases: a holder that dies stops blocking others once the hold
//! timeout passes. [`AcquiredLock`] releases its lease when dropped, so every
//! exit path of a pass (return, `?`, panic) gives the lock back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Lease-based lock backend.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try once to take `key` for `hold`. Returns whether the lease was granted to `token`.
    async fn try_acquire(&self, key: &str, token: &str, hold: Duration) -> Result<bool>;

    /// Give the lease back if `token` still holds it. Must not block.
    fn release(&self, key: &str, token: &str);
}

/// Polls a [`LockManager`] until a lease is granted or the wait timeout passes.
#[derive(Clone)]
pub struct PersistentLocker {
    manager: Arc<dyn LockManager>,
    poll_interval: Duration,
}

impl PersistentLocker {
    pub fn new(manager: Arc<dyn LockManager>) -> Self {
        Self {
            manager,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Acquire `key`, waiting at most `wait` and holding at most `hold`.
    pub async fn acquire(&self, key: &str, wait: Duration, hold: Duration) -> Result<AcquiredLock> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            if self.manager.try_acquire(key, &token, hold).await? {
                debug!(lock_key = key, "Lock acquired");
                return Ok(AcquiredLock {
                    key: key.to_string(),
                    token,
                    manager: self.manager.clone(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(lock_key = key, wait_secs = wait.as_secs(), "Timed out waiting for lock");
                return Err(SyncError::LockTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Held lease; released on drop.
pub struct AcquiredLock {
    key: String,
    token: String,
    manager: Arc<dyn LockManager>,
}

impl AcquiredLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for AcquiredLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredLock")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Drop for AcquiredLock {
    fn drop(&mut self) {
        self.manager.release(&self.key, &self.token);
        debug!(lock_key = %self.key, "Lock released");
    }
}

/// Process-local lease table.
#[derive(Default)]
pub struct MemoryLockManager {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently leased.
    pub fn is_held(&self, key: &str) -> bool {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(key)
            .is_some_and(|(_, until)| *until > Instant::now())
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &str, token: &str, hold: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(key) {
            Some((_, until)) if *until > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), (token.to_string(), now + hold));
                Ok(true)
            }
        }
    }

    fn release(&self, key: &str, token: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(key).is_some_and(|(holder, _)| holder == token) {
            leases.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lock_released_on_drop() {
        let manager = Arc::new(MemoryLockManager::new());
        let locker = PersistentLocker::new(manager.clone());

        {
            let lock = locker
                .acquire("INSTANCE_SYNC:im-1", Duration::from_secs(1), Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(lock.key(), "INSTANCE_SYNC:im-1");
            assert!(manager.is_held("INSTANCE_SYNC:im-1"));
        }

        assert!(!manager.is_held("INSTANCE_SYNC:im-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_times_out() {
        let manager = Arc::new(MemoryLockManager::new());
        let locker = PersistentLocker::new(manager);

        let _held = locker
            .acquire("k", Duration::from_secs(1), Duration::from_secs(200))
            .await
            .unwrap();
        let err = locker
            .acquire("k", Duration::from_secs(2), Duration::from_secs(200))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "LOCK_TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_holder_does_not_release_new_lease() {
        let manager = Arc::new(MemoryLockManager::new());
        let locker = PersistentLocker::new(manager.clone());

        let stale = locker
            .acquire("k", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let _fresh = locker
            .acquire("k", Duration::from_secs(1), Duration::from_secs(60))
            .await
            .unwrap();
        drop(stale);
        assert!(manager.is_held("k"));
    }
}
