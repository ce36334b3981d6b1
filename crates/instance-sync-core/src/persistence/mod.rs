// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for instance-sync-core.
//!
//! The reconciliation core only talks to storage through these narrow
//! traits. Two backends ship with the crate: an in-process [`MemoryStore`]
//! and a PostgreSQL [`PostgresStore`].

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::{PostgresLockManager, PostgresStore};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    DeploymentSummary, InfrastructureMapping, InstanceRecord, PerpetualTaskLedgerEntry,
};

/// Instance inventory.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// All non-deleted instances of a mapping.
    async fn list_by_mapping(&self, infrastructure_mapping_id: &str)
    -> Result<Vec<InstanceRecord>>;

    /// All non-deleted instances on a logical infrastructure, whatever mapping they point at.
    async fn list_by_infrastructure_key(
        &self,
        account_id: &str,
        infrastructure_key: &str,
    ) -> Result<Vec<InstanceRecord>>;

    /// Delete one instance. Returns whether a record was removed.
    async fn delete(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
        instance_key: &str,
    ) -> Result<bool>;

    /// Insert unless a record with the same identity exists. Returns whether it was inserted.
    async fn upsert_if_absent(&self, record: &InstanceRecord) -> Result<bool>;

    /// Overwrite the record with the same id.
    async fn replace(&self, record: &InstanceRecord) -> Result<()>;

    /// Delete every instance of a mapping. Returns how many were removed.
    async fn delete_all_by_mapping(&self, infrastructure_mapping_id: &str) -> Result<u64>;
}

/// Persisted deployment summaries.
#[async_trait]
pub trait DeploymentSummaryStore: Send + Sync {
    async fn save_summary(&self, summary: &DeploymentSummary) -> Result<()>;

    /// Most recent summary for a sync key on a mapping.
    async fn latest_for_sync_key(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
        sync_key: &str,
    ) -> Result<Option<DeploymentSummary>>;
}

/// Infrastructure mappings.
#[async_trait]
pub trait InfraMappingStore: Send + Sync {
    async fn get_mapping(&self, id: &str) -> Result<Option<InfrastructureMapping>>;

    async fn save_mapping(&self, mapping: &InfrastructureMapping) -> Result<()>;
}

/// Perpetual task ledger plus the connector to batched-task mapping.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_entry(&self, account_id: &str, id: &str)
    -> Result<Option<PerpetualTaskLedgerEntry>>;

    async fn get_entry_by_mapping(
        &self,
        infrastructure_mapping_id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>>;

    /// Entry watched by a legacy (V1) task.
    async fn get_entry_by_v1_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>>;

    /// Page of entries bound to a batched (V2) task, ordered by id.
    async fn list_entries_by_v2_task(
        &self,
        account_id: &str,
        task_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>>;

    /// Page of all entries with id greater than `after_id`, ordered by id.
    async fn list_entries_after(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>>;

    /// Number of entries still bound to a batched task.
    async fn count_entries_by_v2_task(&self, account_id: &str, task_id: &str) -> Result<u64>;

    /// Insert or overwrite an entry.
    async fn save_entry(&self, entry: &PerpetualTaskLedgerEntry) -> Result<()>;

    async fn delete_entry(&self, id: &str) -> Result<()>;

    async fn find_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<Option<String>>;

    async fn save_v2_task(&self, account_id: &str, connector_ref: &str, task_id: &str)
    -> Result<()>;

    async fn delete_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<()>;
}

/// Existence checks against entities owned by other subsystems.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn service_exists(&self, mapping: &InfrastructureMapping) -> Result<bool>;

    async fn environment_exists(&self, mapping: &InfrastructureMapping) -> Result<bool>;

    async fn connector_exists(&self, account_id: &str, connector_ref: &str) -> Result<bool>;
}
