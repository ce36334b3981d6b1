// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend.
//!
//! Query functions take a `&PgPool` and are usable on their own; the
//! [`PostgresStore`] trait impls delegate to them. JSON payloads are stored
//! as text. Instances are soft-deleted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::lock::LockManager;
use crate::model::{
    DeploymentSummary, InfrastructureMapping, InstanceInfo, InstanceRecord,
    PerpetualTaskLedgerEntry, TaskProtocol,
};

use super::{DeploymentSummaryStore, InfraMappingStore, InstanceStore, LedgerStore};

/// PostgreSQL-backed store for instances, summaries, mappings and the ledger.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: String,
    account_id: String,
    org_id: Option<String>,
    project_id: Option<String>,
    infrastructure_mapping_id: String,
    infrastructure_key: String,
    instance_key: String,
    deployment_type: String,
    infrastructure_kind: String,
    service_id: String,
    env_id: String,
    connector_ref: String,
    instance_info: String,
    metadata: String,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = SyncError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            account_id: row.account_id,
            org_id: row.org_id,
            project_id: row.project_id,
            infrastructure_mapping_id: row.infrastructure_mapping_id,
            infrastructure_key: row.infrastructure_key,
            instance_key: row.instance_key,
            deployment_type: row.deployment_type,
            infrastructure_kind: row.infrastructure_kind,
            service_id: row.service_id,
            env_id: row.env_id,
            connector_ref: row.connector_ref,
            instance_info: InstanceInfo::new(serde_json::from_str(&row.instance_info)?),
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: row.created_at,
            last_modified_at: row.last_modified_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: String,
    account_id: String,
    org_id: Option<String>,
    project_id: Option<String>,
    infrastructure_mapping_id: String,
    deployment_info_details: String,
    protocol: Option<String>,
    task_id: Option<String>,
    connector_ref: Option<String>,
    last_successful_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for PerpetualTaskLedgerEntry {
    type Error = SyncError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let protocol = match (row.protocol.as_deref(), row.task_id, row.connector_ref) {
            (Some("V1"), Some(task_id), _) => Some(TaskProtocol::V1 { task_id }),
            (Some("V2"), Some(task_id), Some(connector_ref)) => Some(TaskProtocol::V2 {
                task_id,
                connector_ref,
            }),
            (None, _, _) => None,
            (Some(other), _, _) => {
                return Err(SyncError::store(
                    "decode_ledger_entry",
                    format!("inconsistent protocol columns for entry '{}': {}", row.id, other),
                ));
            }
        };

        Ok(Self {
            deployment_info_details: serde_json::from_str(&row.deployment_info_details)?,
            id: row.id,
            account_id: row.account_id,
            org_id: row.org_id,
            project_id: row.project_id,
            infrastructure_mapping_id: row.infrastructure_mapping_id,
            protocol,
            last_successful_run: row.last_successful_run,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn protocol_columns(protocol: Option<&TaskProtocol>) -> (Option<&'static str>, Option<&str>, Option<&str>) {
    match protocol {
        Some(TaskProtocol::V1 { task_id }) => (Some("V1"), Some(task_id.as_str()), None),
        Some(TaskProtocol::V2 {
            task_id,
            connector_ref,
        }) => (Some("V2"), Some(task_id.as_str()), Some(connector_ref.as_str())),
        None => (None, None, None),
    }
}

const INSTANCE_COLUMNS: &str = r#"
    id, account_id, org_id, project_id, infrastructure_mapping_id, infrastructure_key,
    instance_key, deployment_type, infrastructure_kind, service_id, env_id, connector_ref,
    instance_info, metadata, created_at, last_modified_at
"#;

const LEDGER_COLUMNS: &str = r#"
    id, account_id, org_id, project_id, infrastructure_mapping_id, deployment_info_details,
    protocol, task_id, connector_ref, last_successful_run, created_at, updated_at
"#;

// ============================================================================
// Instance Operations
// ============================================================================

/// Live instances of a mapping.
pub async fn list_instances_by_mapping(
    pool: &PgPool,
    infrastructure_mapping_id: &str,
) -> Result<Vec<InstanceRecord>> {
    let rows = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances WHERE infrastructure_mapping_id = $1 AND NOT is_deleted ORDER BY instance_key",
        INSTANCE_COLUMNS
    ))
    .bind(infrastructure_mapping_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(InstanceRecord::try_from).collect()
}

/// Live instances on a logical infrastructure.
pub async fn list_instances_by_infrastructure_key(
    pool: &PgPool,
    account_id: &str,
    infrastructure_key: &str,
) -> Result<Vec<InstanceRecord>> {
    let rows = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {} FROM instances WHERE account_id = $1 AND infrastructure_key = $2 AND NOT is_deleted",
        INSTANCE_COLUMNS
    ))
    .bind(account_id)
    .bind(infrastructure_key)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(InstanceRecord::try_from).collect()
}

/// Soft-delete one instance.
pub async fn delete_instance(
    pool: &PgPool,
    account_id: &str,
    infrastructure_mapping_id: &str,
    instance_key: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET is_deleted = TRUE, deleted_at = NOW()
        WHERE account_id = $1 AND infrastructure_mapping_id = $2 AND instance_key = $3
          AND NOT is_deleted
        "#,
    )
    .bind(account_id)
    .bind(infrastructure_mapping_id)
    .bind(instance_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert unless a live record with the same mapping and instance key exists.
pub async fn insert_instance_if_absent(pool: &PgPool, record: &InstanceRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO instances (
            id, account_id, org_id, project_id, infrastructure_mapping_id, infrastructure_key,
            instance_key, deployment_type, infrastructure_kind, service_id, env_id, connector_ref,
            instance_info, metadata, created_at, last_modified_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (infrastructure_mapping_id, instance_key) WHERE NOT is_deleted DO NOTHING
        "#,
    )
    .bind(&record.id)
    .bind(&record.account_id)
    .bind(&record.org_id)
    .bind(&record.project_id)
    .bind(&record.infrastructure_mapping_id)
    .bind(&record.infrastructure_key)
    .bind(&record.instance_key)
    .bind(&record.deployment_type)
    .bind(&record.infrastructure_kind)
    .bind(&record.service_id)
    .bind(&record.env_id)
    .bind(&record.connector_ref)
    .bind(serde_json::to_string(record.instance_info.as_value())?)
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.created_at)
    .bind(record.last_modified_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Overwrite the live record with the same id.
pub async fn replace_instance(pool: &PgPool, record: &InstanceRecord) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET org_id = $2, project_id = $3, infrastructure_mapping_id = $4, infrastructure_key = $5,
            instance_key = $6, deployment_type = $7, infrastructure_kind = $8, service_id = $9,
            env_id = $10, connector_ref = $11, instance_info = $12, metadata = $13,
            last_modified_at = $14
        WHERE id = $1 AND NOT is_deleted
        "#,
    )
    .bind(&record.id)
    .bind(&record.org_id)
    .bind(&record.project_id)
    .bind(&record.infrastructure_mapping_id)
    .bind(&record.infrastructure_key)
    .bind(&record.instance_key)
    .bind(&record.deployment_type)
    .bind(&record.infrastructure_kind)
    .bind(&record.service_id)
    .bind(&record.env_id)
    .bind(&record.connector_ref)
    .bind(serde_json::to_string(record.instance_info.as_value())?)
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.last_modified_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        warn!(instance_id = %record.id, "Replace matched no live instance");
    }
    Ok(())
}

/// Soft-delete every instance of a mapping.
pub async fn delete_instances_by_mapping(
    pool: &PgPool,
    infrastructure_mapping_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET is_deleted = TRUE, deleted_at = NOW()
        WHERE infrastructure_mapping_id = $1 AND NOT is_deleted
        "#,
    )
    .bind(infrastructure_mapping_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Deployment Summary Operations
// ============================================================================

pub async fn save_deployment_summary(pool: &PgPool, summary: &DeploymentSummary) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deployment_summaries
            (id, account_id, infrastructure_mapping_id, instance_sync_key, body, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body
        "#,
    )
    .bind(&summary.id)
    .bind(&summary.account_id)
    .bind(&summary.infrastructure_mapping_id)
    .bind(&summary.instance_sync_key)
    .bind(serde_json::to_string(summary)?)
    .bind(summary.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn latest_deployment_summary(
    pool: &PgPool,
    account_id: &str,
    infrastructure_mapping_id: &str,
    sync_key: &str,
) -> Result<Option<DeploymentSummary>> {
    let body: Option<String> = sqlx::query_scalar(
        r#"
        SELECT body FROM deployment_summaries
        WHERE account_id = $1 AND infrastructure_mapping_id = $2 AND instance_sync_key = $3
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .bind(infrastructure_mapping_id)
    .bind(sync_key)
    .fetch_optional(pool)
    .await?;

    body.map(|b| serde_json::from_str(&b).map_err(SyncError::from))
        .transpose()
}

// ============================================================================
// Infrastructure Mapping Operations
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct MappingRow {
    id: String,
    account_id: String,
    org_id: Option<String>,
    project_id: Option<String>,
    service_id: String,
    env_id: String,
    infrastructure_kind: String,
    connector_ref: String,
    infrastructure_key: String,
}

impl From<MappingRow> for InfrastructureMapping {
    fn from(row: MappingRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            org_id: row.org_id,
            project_id: row.project_id,
            service_id: row.service_id,
            env_id: row.env_id,
            infrastructure_kind: row.infrastructure_kind,
            connector_ref: row.connector_ref,
            infrastructure_key: row.infrastructure_key,
        }
    }
}

pub async fn get_mapping(pool: &PgPool, id: &str) -> Result<Option<InfrastructureMapping>> {
    let row = sqlx::query_as::<_, MappingRow>(
        r#"
        SELECT id, account_id, org_id, project_id, service_id, env_id,
               infrastructure_kind, connector_ref, infrastructure_key
        FROM infrastructure_mappings
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(InfrastructureMapping::from))
}

pub async fn save_mapping(pool: &PgPool, mapping: &InfrastructureMapping) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO infrastructure_mappings
            (id, account_id, org_id, project_id, service_id, env_id,
             infrastructure_kind, connector_ref, infrastructure_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            org_id = EXCLUDED.org_id,
            project_id = EXCLUDED.project_id,
            service_id = EXCLUDED.service_id,
            env_id = EXCLUDED.env_id,
            infrastructure_kind = EXCLUDED.infrastructure_kind,
            connector_ref = EXCLUDED.connector_ref,
            infrastructure_key = EXCLUDED.infrastructure_key
        "#,
    )
    .bind(&mapping.id)
    .bind(&mapping.account_id)
    .bind(&mapping.org_id)
    .bind(&mapping.project_id)
    .bind(&mapping.service_id)
    .bind(&mapping.env_id)
    .bind(&mapping.infrastructure_kind)
    .bind(&mapping.connector_ref)
    .bind(&mapping.infrastructure_key)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Ledger Operations
// ============================================================================

async fn fetch_entry(
    pool: &PgPool,
    filter: &str,
    binds: &[&str],
) -> Result<Option<PerpetualTaskLedgerEntry>> {
    let sql = format!("SELECT {} FROM instance_sync_ledger WHERE {}", LEDGER_COLUMNS, filter);
    let mut query = sqlx::query_as::<_, LedgerRow>(&sql);
    for bind in binds {
        query = query.bind(*bind);
    }
    query
        .fetch_optional(pool)
        .await?
        .map(PerpetualTaskLedgerEntry::try_from)
        .transpose()
}

pub async fn get_ledger_entry(
    pool: &PgPool,
    account_id: &str,
    id: &str,
) -> Result<Option<PerpetualTaskLedgerEntry>> {
    fetch_entry(pool, "account_id = $1 AND id = $2", &[account_id, id]).await
}

pub async fn get_ledger_entry_by_mapping(
    pool: &PgPool,
    infrastructure_mapping_id: &str,
) -> Result<Option<PerpetualTaskLedgerEntry>> {
    fetch_entry(
        pool,
        "infrastructure_mapping_id = $1",
        &[infrastructure_mapping_id],
    )
    .await
}

pub async fn get_ledger_entry_by_v1_task(
    pool: &PgPool,
    account_id: &str,
    task_id: &str,
) -> Result<Option<PerpetualTaskLedgerEntry>> {
    fetch_entry(
        pool,
        "account_id = $1 AND protocol = 'V1' AND task_id = $2",
        &[account_id, task_id],
    )
    .await
}

pub async fn list_ledger_entries_by_v2_task(
    pool: &PgPool,
    account_id: &str,
    task_id: &str,
    offset: usize,
    limit: usize,
) -> Result<Vec<PerpetualTaskLedgerEntry>> {
    let rows = sqlx::query_as::<_, LedgerRow>(&format!(
        "SELECT {} FROM instance_sync_ledger WHERE account_id = $1 AND protocol = 'V2' AND task_id = $2 ORDER BY id OFFSET $3 LIMIT $4",
        LEDGER_COLUMNS
    ))
    .bind(account_id)
    .bind(task_id)
    .bind(i64::try_from(offset).unwrap_or(i64::MAX))
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(PerpetualTaskLedgerEntry::try_from)
        .collect()
}

pub async fn list_ledger_entries_after(
    pool: &PgPool,
    after_id: Option<&str>,
    limit: usize,
) -> Result<Vec<PerpetualTaskLedgerEntry>> {
    let rows = sqlx::query_as::<_, LedgerRow>(&format!(
        "SELECT {} FROM instance_sync_ledger WHERE ($1::text IS NULL OR id > $1) ORDER BY id LIMIT $2",
        LEDGER_COLUMNS
    ))
    .bind(after_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(PerpetualTaskLedgerEntry::try_from)
        .collect()
}

pub async fn count_ledger_entries_by_v2_task(
    pool: &PgPool,
    account_id: &str,
    task_id: &str,
) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM instance_sync_ledger
        WHERE account_id = $1 AND protocol = 'V2' AND task_id = $2
        "#,
    )
    .bind(account_id)
    .bind(task_id)
    .fetch_one(pool)
    .await?;

    Ok(count.max(0) as u64)
}

pub async fn save_ledger_entry(pool: &PgPool, entry: &PerpetualTaskLedgerEntry) -> Result<()> {
    let (protocol, task_id, connector_ref) = protocol_columns(entry.protocol.as_ref());
    sqlx::query(
        r#"
        INSERT INTO instance_sync_ledger (
            id, account_id, org_id, project_id, infrastructure_mapping_id,
            deployment_info_details, protocol, task_id, connector_ref,
            last_successful_run, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (id) DO UPDATE SET
            org_id = EXCLUDED.org_id,
            project_id = EXCLUDED.project_id,
            deployment_info_details = EXCLUDED.deployment_info_details,
            protocol = EXCLUDED.protocol,
            task_id = EXCLUDED.task_id,
            connector_ref = EXCLUDED.connector_ref,
            last_successful_run = EXCLUDED.last_successful_run,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.account_id)
    .bind(&entry.org_id)
    .bind(&entry.project_id)
    .bind(&entry.infrastructure_mapping_id)
    .bind(serde_json::to_string(&entry.deployment_info_details)?)
    .bind(protocol)
    .bind(task_id)
    .bind(connector_ref)
    .bind(entry.last_successful_run)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_ledger_entry(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM instance_sync_ledger WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_v2_task(
    pool: &PgPool,
    account_id: &str,
    connector_ref: &str,
) -> Result<Option<String>> {
    let task_id = sqlx::query_scalar(
        "SELECT task_id FROM instance_sync_v2_tasks WHERE account_id = $1 AND connector_ref = $2",
    )
    .bind(account_id)
    .bind(connector_ref)
    .fetch_optional(pool)
    .await?;
    Ok(task_id)
}

pub async fn save_v2_task(
    pool: &PgPool,
    account_id: &str,
    connector_ref: &str,
    task_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instance_sync_v2_tasks (account_id, connector_ref, task_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (account_id, connector_ref) DO UPDATE SET task_id = EXCLUDED.task_id
        "#,
    )
    .bind(account_id)
    .bind(connector_ref)
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_v2_task(pool: &PgPool, account_id: &str, connector_ref: &str) -> Result<()> {
    sqlx::query("DELETE FROM instance_sync_v2_tasks WHERE account_id = $1 AND connector_ref = $2")
        .bind(account_id)
        .bind(connector_ref)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn list_by_mapping(
        &self,
        infrastructure_mapping_id: &str,
    ) -> Result<Vec<InstanceRecord>> {
        list_instances_by_mapping(&self.pool, infrastructure_mapping_id).await
    }

    async fn list_by_infrastructure_key(
        &self,
        account_id: &str,
        infrastructure_key: &str,
    ) -> Result<Vec<InstanceRecord>> {
        list_instances_by_infrastructure_key(&self.pool, account_id, infrastructure_key).await
    }

    async fn delete(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
        instance_key: &str,
    ) -> Result<bool> {
        delete_instance(&self.pool, account_id, infrastructure_mapping_id, instance_key).await
    }

    async fn upsert_if_absent(&self, record: &InstanceRecord) -> Result<bool> {
        insert_instance_if_absent(&self.pool, record).await
    }

    async fn replace(&self, record: &InstanceRecord) -> Result<()> {
        replace_instance(&self.pool, record).await
    }

    async fn delete_all_by_mapping(&self, infrastructure_mapping_id: &str) -> Result<u64> {
        delete_instances_by_mapping(&self.pool, infrastructure_mapping_id).await
    }
}

#[async_trait]
impl DeploymentSummaryStore for PostgresStore {
    async fn save_summary(&self, summary: &DeploymentSummary) -> Result<()> {
        save_deployment_summary(&self.pool, summary).await
    }

    async fn latest_for_sync_key(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
        sync_key: &str,
    ) -> Result<Option<DeploymentSummary>> {
        latest_deployment_summary(&self.pool, account_id, infrastructure_mapping_id, sync_key).await
    }
}

#[async_trait]
impl InfraMappingStore for PostgresStore {
    async fn get_mapping(&self, id: &str) -> Result<Option<InfrastructureMapping>> {
        get_mapping(&self.pool, id).await
    }

    async fn save_mapping(&self, mapping: &InfrastructureMapping) -> Result<()> {
        save_mapping(&self.pool, mapping).await
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn get_entry(
        &self,
        account_id: &str,
        id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>> {
        get_ledger_entry(&self.pool, account_id, id).await
    }

    async fn get_entry_by_mapping(
        &self,
        infrastructure_mapping_id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>> {
        get_ledger_entry_by_mapping(&self.pool, infrastructure_mapping_id).await
    }

    async fn get_entry_by_v1_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>> {
        get_ledger_entry_by_v1_task(&self.pool, account_id, task_id).await
    }

    async fn list_entries_by_v2_task(
        &self,
        account_id: &str,
        task_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>> {
        list_ledger_entries_by_v2_task(&self.pool, account_id, task_id, offset, limit).await
    }

    async fn list_entries_after(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>> {
        list_ledger_entries_after(&self.pool, after_id, limit).await
    }

    async fn count_entries_by_v2_task(&self, account_id: &str, task_id: &str) -> Result<u64> {
        count_ledger_entries_by_v2_task(&self.pool, account_id, task_id).await
    }

    async fn save_entry(&self, entry: &PerpetualTaskLedgerEntry) -> Result<()> {
        save_ledger_entry(&self.pool, entry).await
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        delete_ledger_entry(&self.pool, id).await
    }

    async fn find_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<Option<String>> {
        find_v2_task(&self.pool, account_id, connector_ref).await
    }

    async fn save_v2_task(
        &self,
        account_id: &str,
        connector_ref: &str,
        task_id: &str,
    ) -> Result<()> {
        save_v2_task(&self.pool, account_id, connector_ref, task_id).await
    }

    async fn delete_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<()> {
        delete_v2_task(&self.pool, account_id, connector_ref).await
    }
}

// ============================================================================
// Lock Leases
// ============================================================================

/// Lease table shared by every service instance talking to the same database.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn try_acquire(&self, key: &str, token: &str, hold: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO instance_sync_locks (lock_key, token, locked_until)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (lock_key) DO UPDATE
            SET token = EXCLUDED.token, locked_until = EXCLUDED.locked_until
            WHERE instance_sync_locks.locked_until <= NOW()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(hold.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    fn release(&self, key: &str, token: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = key, "No runtime to release lock, lease will expire");
            return;
        };
        let pool = self.pool.clone();
        let key = key.to_string();
        let token = token.to_string();
        handle.spawn(async move {
            if let Err(e) =
                sqlx::query("DELETE FROM instance_sync_locks WHERE lock_key = $1 AND token = $2")
                    .bind(&key)
                    .bind(&token)
                    .execute(&pool)
                    .await
            {
                warn!(lock_key = %key, error = %e, "Failed to release lock, lease will expire");
            }
        });
    }
}
