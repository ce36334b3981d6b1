// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for instance-sync-core integration tests.
//!
//! Provides TestContext wiring an `InstanceSyncService` over in-memory stores,
//! a recording task client and a manual clock.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use instance_sync_core::handler::BatchedProtocolSupport;
use instance_sync_core::lock::MemoryLockManager;
use instance_sync_core::persistence::{LedgerStore, MemoryStore};
use instance_sync_core::{
    Clock, DeploymentInfo, DeploymentMetadata, DeploymentSummary, HandlerRegistry,
    InfrastructureMapping, InfrastructureOutcome, InstanceInfo, InstanceRecord,
    InstanceSyncConfig, InstanceSyncService, JsonFieldHandler, ManualClock, MemoryTaskClient,
    NewDeploymentEvent, PerpetualTaskLedgerEntry, SyncMonitor,
};

pub const ACCOUNT: &str = "acc-1";
pub const KIND: &str = "KubernetesDirect";

/// One recorded pass: (is_new_deployment, success).
#[derive(Default)]
pub struct RecordingMonitor {
    passes: Mutex<Vec<(bool, bool)>>,
}

impl RecordingMonitor {
    pub fn passes(&self) -> Vec<(bool, bool)> {
        self.passes.lock().unwrap().clone()
    }
}

impl SyncMonitor for RecordingMonitor {
    fn record_pass(&self, _account_id: &str, is_new_deployment: bool, success: bool, _d: Duration) {
        self.passes.lock().unwrap().push((is_new_deployment, success));
    }
}

/// Test context holding the service and handles on its collaborators.
pub struct TestContext {
    pub service: InstanceSyncService,
    pub store: Arc<MemoryStore>,
    pub tasks: MemoryTaskClient,
    pub clock: Arc<ManualClock>,
    pub monitor: Arc<RecordingMonitor>,
    pub locks: Arc<MemoryLockManager>,
    pub mapping: InfrastructureMapping,
}

impl TestContext {
    /// Context using the legacy protocol.
    pub fn new() -> Self {
        Self::with_batched(BatchedProtocolSupport::Disabled)
    }

    /// Context whose Kubernetes handler allows the batched protocol as given.
    pub fn with_batched(batched: BatchedProtocolSupport) -> Self {
        let store = Arc::new(MemoryStore::new());
        let tasks = MemoryTaskClient::new();
        let clock = Arc::new(ManualClock::new(start_time()));
        let monitor = Arc::new(RecordingMonitor::default());
        let locks = Arc::new(MemoryLockManager::new());
        let mapping = mapping("im-1");
        store.seed_mapping(&mapping);

        let handlers = HandlerRegistry::new().with(Arc::new(
            JsonFieldHandler::kubernetes(KIND).with_batched_protocol(batched),
        ));

        let service = InstanceSyncService::builder()
            .config(InstanceSyncConfig {
                lock_wait_timeout: Duration::from_millis(200),
                max_instances_per_entry: 50,
                max_releases_per_entry: 10,
                ..InstanceSyncConfig::default()
            })
            .handlers(handlers)
            .memory_store(store.clone())
            .task_client(Arc::new(tasks.clone()))
            .lock_manager(locks.clone())
            .lock_poll_interval(Duration::from_millis(10))
            .monitor(monitor.clone())
            .clock(clock.clone())
            .build()
            .expect("service should build");

        Self {
            service,
            store,
            tasks,
            clock,
            monitor,
            locks,
            mapping,
        }
    }

    /// Instance keys currently persisted for the default mapping.
    pub fn instance_keys(&self) -> HashSet<String> {
        self.store
            .all_instances()
            .into_iter()
            .filter(|r| r.infrastructure_mapping_id == self.mapping.id)
            .map(|r| r.instance_key)
            .collect()
    }

    pub fn instance(&self, instance_key: &str) -> Option<InstanceRecord> {
        self.store
            .all_instances()
            .into_iter()
            .find(|r| r.instance_key == instance_key)
    }

    pub async fn entry(&self) -> Option<PerpetualTaskLedgerEntry> {
        self.store.get_entry_by_mapping(&self.mapping.id).await.unwrap()
    }

    /// Persist an instance directly under the default mapping.
    pub fn seed_instance(&self, pod_name: &str, release: &str, execution: &str) {
        self.store.insert_instance(InstanceRecord::new(
            &self.mapping,
            "Kubernetes",
            format!("{}_ns", pod_name),
            pod(pod_name, release),
            metadata(execution, self.clock.now()),
            self.clock.now(),
        ));
    }
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn mapping(id: &str) -> InfrastructureMapping {
    InfrastructureMapping {
        id: id.to_string(),
        account_id: ACCOUNT.to_string(),
        org_id: Some("org".to_string()),
        project_id: Some("proj".to_string()),
        service_id: "svc".to_string(),
        env_id: "env".to_string(),
        infrastructure_kind: KIND.to_string(),
        connector_ref: "k8s-conn".to_string(),
        infrastructure_key: "cluster-a".to_string(),
    }
}

pub fn pod(name: &str, release: &str) -> InstanceInfo {
    InstanceInfo::new(json!({"podName": name, "namespace": "ns", "releaseName": release}))
}

pub fn release(name: &str) -> DeploymentInfo {
    DeploymentInfo {
        deployment_type: "Kubernetes".to_string(),
        details: json!({"namespace": "ns", "releaseName": name}),
    }
}

pub fn metadata(execution: &str, at: DateTime<Utc>) -> DeploymentMetadata {
    DeploymentMetadata {
        deployed_by_id: "user-1".to_string(),
        deployed_by_name: "Deployer".to_string(),
        pipeline_execution_id: execution.to_string(),
        pipeline_execution_name: "deploy-web".to_string(),
        stage_status: Some("SUCCESS".to_string()),
        rollback_status: None,
        artifact: None,
        deployed_at: at,
    }
}

pub fn summary(
    mapping: &InfrastructureMapping,
    release_name: &str,
    execution: &str,
    pods: &[&str],
    at: DateTime<Utc>,
) -> DeploymentSummary {
    DeploymentSummary {
        id: format!("ds-{}", execution),
        account_id: mapping.account_id.clone(),
        org_id: mapping.org_id.clone(),
        project_id: mapping.project_id.clone(),
        instance_sync_key: format!("ns_{}", release_name),
        infrastructure_mapping_id: mapping.id.clone(),
        deployment_info: release(release_name),
        metadata: metadata(execution, at),
        server_instances: pods.iter().map(|p| pod(p, release_name)).collect(),
        created_at: at,
    }
}

pub fn event(summary: DeploymentSummary, mapping: &InfrastructureMapping) -> NewDeploymentEvent {
    NewDeploymentEvent {
        deployment_summary: summary,
        infrastructure_outcome: InfrastructureOutcome {
            kind: mapping.infrastructure_kind.clone(),
            connector_ref: mapping.connector_ref.clone(),
            infrastructure_key: mapping.infrastructure_key.clone(),
        },
    }
}

pub fn keys(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}
