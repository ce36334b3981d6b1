// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Perpetual task ledger: which deployment units each mapping watches and how.
//!
//! An entry tracks a set of deployment infos with their last-seen time and
//! at most one active collector protocol. The protocol moves between the
//! legacy per-entry task (V1) and the batched per-connector task (V2)
//! through [`PerpetualTaskLedger::migrate`] only.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::InstanceSyncConfig;
use crate::error::{Result, SyncError};
use crate::handler::InstanceSyncHandler;
use crate::lock::{AcquiredLock, PersistentLocker};
use crate::model::{
    DeploymentInfo, DeploymentInfoDetail, InfrastructureMapping, PerpetualTaskLedgerEntry,
    TaskProtocol,
};
use crate::perpetual_task::PerpetualTaskClient;
use crate::persistence::{EntityLookup, LedgerStore};

/// Target of a protocol migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    V1,
    V2,
}

impl ProtocolKind {
    fn of(protocol: &TaskProtocol) -> Self {
        match protocol {
            TaskProtocol::V1 { .. } => Self::V1,
            TaskProtocol::V2 { .. } => Self::V2,
        }
    }
}

/// Result of pruning an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationOutcome {
    Retained { tracked: usize, pruned: usize },
    /// Nothing left to watch; the entry and its tasks are gone.
    Deleted,
}

/// Totals of one sweep over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub pruned_details: usize,
    pub deleted_entries: usize,
    pub failed_entries: usize,
}

/// Ledger bookkeeping for every infrastructure mapping.
///
/// Methods taking an entry expect the caller to hold that entry's mapping
/// lock. [`sweep`](Self::sweep) and
/// [`cleanup_entry_if_stale_failing`](Self::cleanup_entry_if_stale_failing)
/// run outside reconciliation passes and take the lock themselves.
pub struct PerpetualTaskLedger {
    store: Arc<dyn LedgerStore>,
    tasks: Arc<dyn PerpetualTaskClient>,
    entities: Arc<dyn EntityLookup>,
    clock: Arc<dyn Clock>,
    locker: PersistentLocker,
    config: InstanceSyncConfig,
    staleness: chrono::Duration,
    failing_cleanup_after: chrono::Duration,
}

impl PerpetualTaskLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        tasks: Arc<dyn PerpetualTaskClient>,
        entities: Arc<dyn EntityLookup>,
        clock: Arc<dyn Clock>,
        locker: PersistentLocker,
        config: &InstanceSyncConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            entities,
            clock,
            locker,
            config: config.clone(),
            staleness: to_chrono(config.deployment_info_staleness),
            failing_cleanup_after: to_chrono(config.failing_cleanup_after),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Refresh deployment infos seen this pass and drop those stale for the staleness window.
    ///
    /// Deletes the entry (and its tasks) when nothing is left to watch.
    pub async fn record_observation(
        &self,
        entry: &mut PerpetualTaskLedgerEntry,
        handler: &dyn InstanceSyncHandler,
        seen_sync_keys: &HashSet<String>,
    ) -> Result<ObservationOutcome> {
        let now = self.clock.now();
        let before = entry.deployment_info_details.len();
        let staleness = self.staleness;

        entry.deployment_info_details.retain_mut(|detail| {
            let seen = handler
                .deployment_info_sync_key(&detail.deployment_info)
                .map(|key| seen_sync_keys.contains(&key))
                .unwrap_or(false);
            if seen {
                detail.last_used_at = now;
                true
            } else {
                now - detail.last_used_at < staleness
            }
        });

        self.finish_pruning(entry, before, now).await
    }

    /// Drop deployment infos stale for the staleness window without refreshing any.
    pub async fn prune_stale(
        &self,
        entry: &mut PerpetualTaskLedgerEntry,
    ) -> Result<ObservationOutcome> {
        let now = self.clock.now();
        let before = entry.deployment_info_details.len();
        let staleness = self.staleness;
        entry
            .deployment_info_details
            .retain(|detail| now - detail.last_used_at < staleness);
        self.finish_pruning(entry, before, now).await
    }

    async fn finish_pruning(
        &self,
        entry: &mut PerpetualTaskLedgerEntry,
        before: usize,
        now: DateTime<Utc>,
    ) -> Result<ObservationOutcome> {
        let pruned = before - entry.deployment_info_details.len();

        if entry.deployment_info_details.is_empty() {
            info!(
                infrastructure_mapping_id = %entry.infrastructure_mapping_id,
                "No deployment infos left to watch, deleting ledger entry"
            );
            self.delete_entry(entry).await?;
            return Ok(ObservationOutcome::Deleted);
        }

        entry.updated_at = now;
        self.store.save_entry(entry).await?;

        if pruned > 0 {
            debug!(
                infrastructure_mapping_id = %entry.infrastructure_mapping_id,
                pruned,
                "Pruned stale deployment infos"
            );
            if let Some(TaskProtocol::V1 { task_id }) = &entry.protocol {
                self.tasks
                    .reset_v1_task(&entry.account_id, task_id, &entry.deployment_infos())
                    .await?;
            }
        }

        Ok(ObservationOutcome::Retained {
            tracked: entry.deployment_info_details.len(),
            pruned,
        })
    }

    /// Start watching `deployment_info` on `mapping` after a deployment.
    ///
    /// Creates the entry on first use, adds the deployment info if its sync
    /// key is new, and moves the entry to the protocol selected by
    /// `use_batched`. A new entry that cannot get a collector task is removed
    /// again so the next deployment starts over.
    pub async fn track_deployment(
        &self,
        mapping: &InfrastructureMapping,
        handler: &dyn InstanceSyncHandler,
        deployment_info: &DeploymentInfo,
        use_batched: bool,
    ) -> Result<PerpetualTaskLedgerEntry> {
        let now = self.clock.now();
        let sync_key = handler.deployment_info_sync_key(deployment_info)?;
        let wanted = if use_batched {
            ProtocolKind::V2
        } else {
            ProtocolKind::V1
        };

        let Some(mut entry) = self.store.get_entry_by_mapping(&mapping.id).await? else {
            let mut entry = PerpetualTaskLedgerEntry::new(mapping, now);
            entry.deployment_info_details.push(DeploymentInfoDetail {
                deployment_info: deployment_info.clone(),
                last_used_at: now,
            });
            self.store.save_entry(&entry).await?;
            info!(
                infrastructure_mapping_id = %mapping.id,
                sync_key,
                protocol = ?wanted,
                "Created ledger entry"
            );
            if let Err(e) = self.migrate(&mut entry, mapping, wanted).await {
                warn!(
                    infrastructure_mapping_id = %mapping.id,
                    error = %e,
                    "No collector task for new ledger entry, removing it"
                );
                self.store.delete_entry(&entry.id).await?;
                return Err(e);
            }
            return Ok(entry);
        };

        let mut changed = false;
        match entry.deployment_info_details.iter_mut().find(|detail| {
            handler
                .deployment_info_sync_key(&detail.deployment_info)
                .is_ok_and(|key| key == sync_key)
        }) {
            Some(detail) => detail.last_used_at = now,
            None => {
                entry.deployment_info_details.push(DeploymentInfoDetail {
                    deployment_info: deployment_info.clone(),
                    last_used_at: now,
                });
                changed = true;
            }
        }
        entry.updated_at = now;
        self.store.save_entry(&entry).await?;

        let current = entry.protocol.as_ref().map(ProtocolKind::of);
        if current != Some(wanted) {
            self.migrate(&mut entry, mapping, wanted).await?;
        } else if changed && let Some(TaskProtocol::V1 { task_id }) = &entry.protocol {
            self.tasks
                .reset_v1_task(&entry.account_id, task_id, &entry.deployment_infos())
                .await?;
        }

        Ok(entry)
    }

    /// Move `entry` to `to`, creating and releasing collector tasks on the way.
    ///
    /// Moving to V2 requires the mapping's connector. When it is gone, the
    /// connector's batched task is deleted and [`SyncError::ConnectorNotFound`]
    /// is returned with the entry left on its previous protocol.
    pub async fn migrate(
        &self,
        entry: &mut PerpetualTaskLedgerEntry,
        mapping: &InfrastructureMapping,
        to: ProtocolKind,
    ) -> Result<()> {
        if entry.protocol.as_ref().map(ProtocolKind::of) == Some(to) {
            return Ok(());
        }

        let previous = match to {
            ProtocolKind::V2 => {
                let connector_ref = &mapping.connector_ref;
                if !self
                    .entities
                    .connector_exists(&entry.account_id, connector_ref)
                    .await?
                {
                    if let Some(task_id) =
                        self.store.find_v2_task(&entry.account_id, connector_ref).await?
                    {
                        warn!(
                            connector_ref = %connector_ref,
                            perpetual_task_id = %task_id,
                            "Connector vanished, deleting its batched task"
                        );
                        self.tasks.delete_task(&entry.account_id, &task_id).await?;
                        self.store
                            .delete_v2_task(&entry.account_id, connector_ref)
                            .await?;
                    }
                    return Err(SyncError::ConnectorNotFound {
                        account_id: entry.account_id.clone(),
                        connector_ref: connector_ref.clone(),
                    });
                }

                let task_id = match self.store.find_v2_task(&entry.account_id, connector_ref).await? {
                    Some(task_id) => task_id,
                    None => {
                        let task_id = self
                            .tasks
                            .create_v2_task(&entry.account_id, connector_ref)
                            .await?;
                        self.store
                            .save_v2_task(&entry.account_id, connector_ref, &task_id)
                            .await?;
                        task_id
                    }
                };
                entry.protocol.replace(TaskProtocol::V2 {
                    task_id,
                    connector_ref: connector_ref.clone(),
                })
            }
            ProtocolKind::V1 => {
                let task_id = self
                    .tasks
                    .create_v1_task(mapping, &entry.deployment_infos())
                    .await?;
                entry.protocol.replace(TaskProtocol::V1 { task_id })
            }
        };

        entry.updated_at = self.clock.now();
        self.store.save_entry(entry).await?;
        info!(
            infrastructure_mapping_id = %entry.infrastructure_mapping_id,
            from = ?previous.as_ref().map(ProtocolKind::of),
            to = ?to,
            "Migrated perpetual task protocol"
        );

        if let Some(previous) = previous {
            self.release_task(&entry.account_id, &previous).await?;
        }
        Ok(())
    }

    /// Delete the entry if its last successful run is older than the failing threshold.
    pub async fn cleanup_if_stale_failing(&self, entry: &PerpetualTaskLedgerEntry) -> Result<bool> {
        let Some(last_run) = entry.last_successful_run else {
            return Ok(false);
        };
        if self.clock.now() - last_run <= self.failing_cleanup_after {
            return Ok(false);
        }

        warn!(
            infrastructure_mapping_id = %entry.infrastructure_mapping_id,
            last_successful_run = %last_run,
            "Perpetual task has been failing too long, deleting ledger entry"
        );
        self.delete_entry(entry).await?;
        Ok(true)
    }

    /// Reload the entry under its mapping lock, then apply [`cleanup_if_stale_failing`](Self::cleanup_if_stale_failing).
    pub async fn cleanup_entry_if_stale_failing(
        &self,
        account_id: &str,
        entry_id: &str,
    ) -> Result<bool> {
        let Some(entry) = self.store.get_entry(account_id, entry_id).await? else {
            return Ok(false);
        };
        let _lock = self.lock_mapping(&entry.infrastructure_mapping_id).await?;
        match self.store.get_entry(account_id, entry_id).await? {
            Some(entry) => self.cleanup_if_stale_failing(&entry).await,
            None => Ok(false),
        }
    }

    /// Remove the entry and release its collector task.
    pub async fn delete_entry(&self, entry: &PerpetualTaskLedgerEntry) -> Result<()> {
        self.store.delete_entry(&entry.id).await?;
        if let Some(protocol) = &entry.protocol {
            self.release_task(&entry.account_id, protocol).await?;
        }
        Ok(())
    }

    /// Stamp a successful collector run and persist it.
    pub async fn mark_successful_run(&self, entry: &mut PerpetualTaskLedgerEntry) -> Result<()> {
        let now = self.clock.now();
        entry.last_successful_run = Some(now);
        entry.updated_at = now;
        self.store.save_entry(entry).await
    }

    async fn release_task(&self, account_id: &str, protocol: &TaskProtocol) -> Result<()> {
        match protocol {
            TaskProtocol::V1 { task_id } => self.tasks.delete_task(account_id, task_id).await,
            TaskProtocol::V2 {
                task_id,
                connector_ref,
            } => {
                let remaining = self.store.count_entries_by_v2_task(account_id, task_id).await?;
                if remaining > 0 {
                    debug!(perpetual_task_id = %task_id, remaining, "Batched task still in use");
                    return Ok(());
                }
                self.tasks.delete_task(account_id, task_id).await?;
                self.store.delete_v2_task(account_id, connector_ref).await
            }
        }
    }

    async fn lock_mapping(&self, infrastructure_mapping_id: &str) -> Result<AcquiredLock> {
        self.locker
            .acquire(
                &self.config.lock_key(infrastructure_mapping_id),
                self.config.lock_wait_timeout,
                self.config.lock_hold_timeout,
            )
            .await
    }

    /// Walk every entry under its mapping lock, applying the failing-run cleanup
    /// and staleness pruning.
    pub async fn sweep(&self, batch_size: usize) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut after: Option<String> = None;

        loop {
            let page = self
                .store
                .list_entries_after(after.as_deref(), batch_size.max(1))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let page_len = page.len();

            for entry in page {
                report.scanned += 1;
                match self.sweep_entry(&entry).await {
                    Ok(Some(pruned)) => report.pruned_details += pruned,
                    Ok(None) => report.deleted_entries += 1,
                    Err(e) => {
                        report.failed_entries += 1;
                        warn!(
                            infrastructure_mapping_id = %entry.infrastructure_mapping_id,
                            error = %e,
                            "Ledger sweep failed for entry"
                        );
                    }
                }
            }

            if page_len < batch_size.max(1) {
                break;
            }
        }

        Ok(report)
    }

    /// Returns the pruned count, or `None` when the entry was deleted.
    async fn sweep_entry(&self, listed: &PerpetualTaskLedgerEntry) -> Result<Option<usize>> {
        let _lock = self.lock_mapping(&listed.infrastructure_mapping_id).await?;
        let Some(mut entry) = self.store.get_entry(&listed.account_id, &listed.id).await? else {
            debug!(task_info_id = %listed.id, "Ledger entry gone before sweep");
            return Ok(Some(0));
        };

        if self.cleanup_if_stale_failing(&entry).await? {
            return Ok(None);
        }
        match self.prune_stale(&mut entry).await? {
            ObservationOutcome::Retained { pruned, .. } => Ok(Some(pruned)),
            ObservationOutcome::Deleted => Ok(None),
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
