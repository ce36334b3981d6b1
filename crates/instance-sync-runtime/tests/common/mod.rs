// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for instance-sync-runtime tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use instance_sync_core::persistence::MemoryStore;
use instance_sync_core::{
    Clock, DeploymentInfo, DeploymentMetadata, DeploymentSummary, HandlerRegistry,
    InfrastructureMapping, InfrastructureOutcome, InstanceInfo, InstanceSyncService,
    JsonFieldHandler, ManualClock, MemoryTaskClient, NewDeploymentEvent,
};

pub const ACCOUNT: &str = "acc-1";

/// Service over in-memory backends with `count` seeded mappings.
pub struct TestContext {
    pub service: Arc<InstanceSyncService>,
    pub store: Arc<MemoryStore>,
    pub tasks: MemoryTaskClient,
    pub clock: Arc<ManualClock>,
    pub mappings: Vec<InfrastructureMapping>,
}

impl TestContext {
    pub fn new(count: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let tasks = MemoryTaskClient::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mappings: Vec<_> = (0..count)
            .map(|i| InfrastructureMapping {
                id: format!("im-{}", i),
                account_id: ACCOUNT.to_string(),
                org_id: None,
                project_id: None,
                service_id: "svc".to_string(),
                env_id: "env".to_string(),
                infrastructure_kind: "KubernetesDirect".to_string(),
                connector_ref: "k8s-conn".to_string(),
                infrastructure_key: format!("cluster-{}", i),
            })
            .collect();
        for mapping in &mappings {
            store.seed_mapping(mapping);
        }

        let service = InstanceSyncService::builder()
            .handlers(
                HandlerRegistry::new().with(Arc::new(JsonFieldHandler::kubernetes(
                    "KubernetesDirect",
                ))),
            )
            .memory_store(store.clone())
            .task_client(Arc::new(tasks.clone()))
            .clock(clock.clone())
            .build()
            .expect("service should build");

        Self {
            service: Arc::new(service),
            store,
            tasks,
            clock,
            mappings,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Deployment of `pods` in release `web` on mapping `index`.
    pub fn event(&self, index: usize, pods: &[&str]) -> NewDeploymentEvent {
        let mapping = &self.mappings[index];
        let now = self.now();
        NewDeploymentEvent {
            deployment_summary: DeploymentSummary {
                id: format!("ds-{}", mapping.id),
                account_id: mapping.account_id.clone(),
                org_id: None,
                project_id: None,
                instance_sync_key: "ns_web".to_string(),
                infrastructure_mapping_id: mapping.id.clone(),
                deployment_info: DeploymentInfo {
                    deployment_type: "Kubernetes".to_string(),
                    details: json!({"namespace": "ns", "releaseName": "web"}),
                },
                metadata: DeploymentMetadata {
                    deployed_by_id: "user-1".to_string(),
                    deployed_by_name: "Deployer".to_string(),
                    pipeline_execution_id: "exec-1".to_string(),
                    pipeline_execution_name: "deploy-web".to_string(),
                    stage_status: None,
                    rollback_status: None,
                    artifact: None,
                    deployed_at: now,
                },
                server_instances: pods
                    .iter()
                    .map(|p| {
                        InstanceInfo::new(
                            json!({"podName": p, "namespace": "ns", "releaseName": "web"}),
                        )
                    })
                    .collect(),
                created_at: now,
            },
            infrastructure_outcome: InfrastructureOutcome {
                kind: mapping.infrastructure_kind.clone(),
                connector_ref: mapping.connector_ref.clone(),
                infrastructure_key: mapping.infrastructure_key.clone(),
            },
        }
    }

    pub fn instance_count(&self, index: usize) -> usize {
        let id = &self.mappings[index].id;
        self.store
            .all_instances()
            .iter()
            .filter(|r| &r.infrastructure_mapping_id == id)
            .count()
    }
}
