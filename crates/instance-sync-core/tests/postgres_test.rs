// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend tests.
//!
//! Require a database reachable through TEST_INSTANCE_SYNC_DATABASE_URL.

mod common;

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use common::*;
use instance_sync_core::lock::{LockManager, PersistentLocker};
use instance_sync_core::persistence::{
    DeploymentSummaryStore, InfraMappingStore, InstanceStore, LedgerStore, PostgresLockManager,
    PostgresStore,
};
use instance_sync_core::{
    DeploymentInfoDetail, InfrastructureMapping, InstanceRecord, PerpetualTaskLedgerEntry,
    SyncError, TaskProtocol,
};

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_INSTANCE_SYNC_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_INSTANCE_SYNC_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a database pool for testing
async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_INSTANCE_SYNC_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    instance_sync_core::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// Mapping with ids unique to this test run.
fn unique_mapping() -> InfrastructureMapping {
    let suffix = Uuid::new_v4().to_string();
    let mut mapping = mapping(&format!("im-{}", suffix));
    mapping.account_id = format!("acc-{}", suffix);
    mapping.infrastructure_key = format!("cluster-{}", suffix);
    mapping
}

fn record(mapping: &InfrastructureMapping, pod_name: &str, release: &str) -> InstanceRecord {
    InstanceRecord::new(
        mapping,
        "Kubernetes",
        format!("{}_ns", pod_name),
        pod(pod_name, release),
        metadata("exec-1", Utc::now()),
        Utc::now(),
    )
}

#[tokio::test]
async fn test_mapping_round_trip() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let store = PostgresStore::new(pool);
    let mapping = unique_mapping();

    assert!(store.get_mapping(&mapping.id).await.unwrap().is_none());
    store.save_mapping(&mapping).await.unwrap();
    assert_eq!(store.get_mapping(&mapping.id).await.unwrap(), Some(mapping));
}

#[tokio::test]
async fn test_instance_identity_is_unique_per_mapping() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let store = PostgresStore::new(pool);
    let mapping = unique_mapping();

    assert!(store.upsert_if_absent(&record(&mapping, "a", "web")).await.unwrap());
    // Same instance key, fresh row id: rejected.
    assert!(!store.upsert_if_absent(&record(&mapping, "a", "web")).await.unwrap());
    assert!(store.upsert_if_absent(&record(&mapping, "b", "web")).await.unwrap());

    let listed = store.list_by_mapping(&mapping.id).await.unwrap();
    assert_eq!(listed.len(), 2);

    // A deleted key can be added again.
    assert!(
        store
            .delete(&mapping.account_id, &mapping.id, "a_ns")
            .await
            .unwrap()
    );
    assert!(
        !store
            .delete(&mapping.account_id, &mapping.id, "a_ns")
            .await
            .unwrap()
    );
    assert!(store.upsert_if_absent(&record(&mapping, "a", "web")).await.unwrap());

    assert_eq!(store.delete_all_by_mapping(&mapping.id).await.unwrap(), 2);
    assert!(store.list_by_mapping(&mapping.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replace_moves_instance_between_mappings() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let store = PostgresStore::new(pool);
    let canonical = unique_mapping();
    let mut duplicate = canonical.clone();
    duplicate.id = format!("{}-dup", canonical.id);

    let mut stray = record(&duplicate, "a", "web");
    store.upsert_if_absent(&stray).await.unwrap();
    let by_key = store
        .list_by_infrastructure_key(&canonical.account_id, &canonical.infrastructure_key)
        .await
        .unwrap();
    assert_eq!(by_key.len(), 1);

    stray.infrastructure_mapping_id = canonical.id.clone();
    store.replace(&stray).await.unwrap();

    assert!(store.list_by_mapping(&duplicate.id).await.unwrap().is_empty());
    let moved = store.list_by_mapping(&canonical.id).await.unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].id, stray.id);
    assert_eq!(moved[0].instance_info, stray.instance_info);
}

#[tokio::test]
async fn test_latest_summary_for_sync_key() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let store = PostgresStore::new(pool);
    let mapping = unique_mapping();
    let earlier = Utc::now() - chrono::Duration::hours(1);

    let mut first = summary(&mapping, "web", "exec-1", &["a"], earlier);
    first.id = Uuid::new_v4().to_string();
    let mut second = summary(&mapping, "web", "exec-2", &["a"], Utc::now());
    second.id = Uuid::new_v4().to_string();
    store.save_summary(&first).await.unwrap();
    store.save_summary(&second).await.unwrap();

    let latest = store
        .latest_for_sync_key(&mapping.account_id, &mapping.id, "ns_web")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.metadata.pipeline_execution_id, "exec-2");
    assert!(
        store
            .latest_for_sync_key(&mapping.account_id, &mapping.id, "ns_api")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_ledger_entries_by_task() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let store = PostgresStore::new(pool);
    let first = unique_mapping();
    let mut second = unique_mapping();
    second.account_id = first.account_id.clone();
    let task_id = format!("v2-{}", Uuid::new_v4());

    for mapping in [&first, &second] {
        let mut entry = PerpetualTaskLedgerEntry::new(mapping, Utc::now());
        entry.deployment_info_details.push(DeploymentInfoDetail {
            deployment_info: release("web"),
            last_used_at: Utc::now(),
        });
        entry.protocol = Some(TaskProtocol::V2 {
            task_id: task_id.clone(),
            connector_ref: mapping.connector_ref.clone(),
        });
        store.save_entry(&entry).await.unwrap();
    }

    assert_eq!(
        store
            .count_entries_by_v2_task(&first.account_id, &task_id)
            .await
            .unwrap(),
        2
    );
    let page = store
        .list_entries_by_v2_task(&first.account_id, &task_id, 0, 1)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    let rest = store
        .list_entries_by_v2_task(&first.account_id, &task_id, 1, 10)
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_ne!(page[0].id, rest[0].id);

    let mut entry = store
        .get_entry_by_mapping(&first.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.deployment_info_details.len(), 1);
    assert_eq!(entry.deployment_info_details[0].deployment_info, release("web"));

    // Upsert keeps one row per mapping.
    entry.protocol = Some(TaskProtocol::V1 {
        task_id: format!("v1-{}", Uuid::new_v4()),
    });
    store.save_entry(&entry).await.unwrap();
    let v1_task = entry.protocol.as_ref().unwrap().task_id().to_string();
    let found = store
        .get_entry_by_v1_task(&first.account_id, &v1_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, entry.id);
    assert_eq!(
        store
            .count_entries_by_v2_task(&first.account_id, &task_id)
            .await
            .unwrap(),
        1
    );

    store.delete_entry(&entry.id).await.unwrap();
    assert!(
        store
            .get_entry(&first.account_id, &entry.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_v2_task_registry() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let store = PostgresStore::new(pool);
    let account = format!("acc-{}", Uuid::new_v4());

    assert!(store.find_v2_task(&account, "conn").await.unwrap().is_none());
    store.save_v2_task(&account, "conn", "task-1").await.unwrap();
    assert_eq!(
        store.find_v2_task(&account, "conn").await.unwrap().as_deref(),
        Some("task-1")
    );
    store.delete_v2_task(&account, "conn").await.unwrap();
    assert!(store.find_v2_task(&account, "conn").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lease_excludes_other_holders_until_expiry() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let locks = PostgresLockManager::new(pool);
    let key = format!("INSTANCE_SYNC:{}", Uuid::new_v4());

    assert!(
        locks
            .try_acquire(&key, "holder-1", Duration::from_secs(1))
            .await
            .unwrap()
    );
    assert!(
        !locks
            .try_acquire(&key, "holder-2", Duration::from_secs(1))
            .await
            .unwrap()
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(
        locks
            .try_acquire(&key, "holder-2", Duration::from_secs(30))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_locker_times_out_on_held_lease() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };
    let locker = PersistentLocker::new(std::sync::Arc::new(PostgresLockManager::new(pool)))
        .with_poll_interval(Duration::from_millis(20));
    let key = format!("INSTANCE_SYNC:{}", Uuid::new_v4());

    let held = locker
        .acquire(&key, Duration::from_millis(200), Duration::from_secs(30))
        .await
        .unwrap();
    let err = locker
        .acquire(&key, Duration::from_millis(100), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LockTimeout { .. }));
    assert_eq!(held.key(), key);
}
