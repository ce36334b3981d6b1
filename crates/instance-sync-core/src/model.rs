// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the reconciliation core.
//!
//! Records mirror what the stores persist. Inbound message shapes
//! (`NewDeploymentEvent`, `PollResponseV1`, `PollResponseV2`) are what the
//! hosting RPC/queue layer hands to the coordinator.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A deployment target: (service, environment, connector, infrastructure kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureMapping {
    /// Unique identifier; instances and ledger entries reference it.
    pub id: String,
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub service_id: String,
    pub env_id: String,
    /// Infrastructure kind (e.g. "KubernetesDirect", "Pdc").
    pub infrastructure_kind: String,
    pub connector_ref: String,
    /// Logical infrastructure key. Two mappings sharing it describe the same target.
    pub infrastructure_key: String,
}

/// Deployment-type specific instance payload as reported by a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceInfo(pub Value);

impl InstanceInfo {
    /// Wrap a JSON payload.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Look up a top-level scalar field as a string.
    pub fn field(&self, name: &str) -> Option<String> {
        scalar_field(&self.0, name)
    }

    /// Borrow the raw payload.
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// The deployment unit a perpetual task is asked to watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Deployment type (e.g. "Kubernetes", "Ssh").
    pub deployment_type: String,
    /// Deployment-type specific details (release name, namespaces, host...).
    pub details: Value,
}

impl DeploymentInfo {
    /// Look up a top-level scalar field of the details as a string.
    pub fn field(&self, name: &str) -> Option<String> {
        scalar_field(&self.details, name)
    }
}

fn scalar_field(value: &Value, name: &str) -> Option<String> {
    match value.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Artifact deployed by a pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDetails {
    pub artifact_id: String,
    pub display_name: String,
    pub tag: Option<String>,
}

/// Execution metadata of the last deployment that touched an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    pub deployed_by_id: String,
    pub deployed_by_name: String,
    pub pipeline_execution_id: String,
    pub pipeline_execution_name: String,
    pub stage_status: Option<String>,
    pub rollback_status: Option<String>,
    pub artifact: Option<ArtifactDetails>,
    pub deployed_at: DateTime<Utc>,
}

/// Snapshot of one deployment, persisted so autoscaled instances can be backfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub id: String,
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    /// Sync key of the deployment unit this summary describes.
    pub instance_sync_key: String,
    pub infrastructure_mapping_id: String,
    pub deployment_info: DeploymentInfo,
    pub metadata: DeploymentMetadata,
    /// Instances the deployment reported right after rollout.
    #[serde(default)]
    pub server_instances: Vec<InstanceInfo>,
    pub created_at: DateTime<Utc>,
}

/// A persisted, non-deleted instance.
///
/// Identity is `(account_id, org_id, project_id, infrastructure_mapping_id, instance_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub infrastructure_mapping_id: String,
    pub infrastructure_key: String,
    pub instance_key: String,
    pub deployment_type: String,
    pub infrastructure_kind: String,
    pub service_id: String,
    pub env_id: String,
    pub connector_ref: String,
    pub instance_info: InstanceInfo,
    /// Last deployment that produced or refreshed this instance.
    pub metadata: DeploymentMetadata,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Build a new record for `mapping` with a fresh id.
    pub fn new(
        mapping: &InfrastructureMapping,
        deployment_type: &str,
        instance_key: String,
        instance_info: InstanceInfo,
        metadata: DeploymentMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: mapping.account_id.clone(),
            org_id: mapping.org_id.clone(),
            project_id: mapping.project_id.clone(),
            infrastructure_mapping_id: mapping.id.clone(),
            infrastructure_key: mapping.infrastructure_key.clone(),
            instance_key,
            deployment_type: deployment_type.to_string(),
            infrastructure_kind: mapping.infrastructure_kind.clone(),
            service_id: mapping.service_id.clone(),
            env_id: mapping.env_id.clone(),
            connector_ref: mapping.connector_ref.clone(),
            instance_info,
            metadata,
            created_at: now,
            last_modified_at: now,
        }
    }
}

/// A watched deployment unit and when it was last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInfoDetail {
    pub deployment_info: DeploymentInfo,
    pub last_used_at: DateTime<Utc>,
}

/// Which perpetual-task protocol watches a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "UPPERCASE")]
pub enum TaskProtocol {
    /// Legacy polling task, one per ledger entry.
    V1 { task_id: String },
    /// Batched task shared by every entry bound to the same connector.
    V2 {
        task_id: String,
        connector_ref: String,
    },
}

impl TaskProtocol {
    /// Perpetual task id regardless of protocol.
    pub fn task_id(&self) -> &str {
        match self {
            Self::V1 { task_id } | Self::V2 { task_id, .. } => task_id,
        }
    }

    /// Whether this is the batched protocol.
    pub fn is_v2(&self) -> bool {
        matches!(self, Self::V2 { .. })
    }
}

/// Per-infrastructure-mapping bookkeeping of watched deployment units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpetualTaskLedgerEntry {
    /// Entry id; doubles as the task-info id in batched responses.
    pub id: String,
    pub account_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub infrastructure_mapping_id: String,
    pub deployment_info_details: Vec<DeploymentInfoDetail>,
    /// Active protocol, at most one at a time.
    pub protocol: Option<TaskProtocol>,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PerpetualTaskLedgerEntry {
    /// Fresh entry for `mapping` with no protocol started yet.
    pub fn new(mapping: &InfrastructureMapping, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: mapping.account_id.clone(),
            org_id: mapping.org_id.clone(),
            project_id: mapping.project_id.clone(),
            infrastructure_mapping_id: mapping.id.clone(),
            deployment_info_details: Vec::new(),
            protocol: None,
            last_successful_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The deployment infos currently watched.
    pub fn deployment_infos(&self) -> Vec<DeploymentInfo> {
        self.deployment_info_details
            .iter()
            .map(|d| d.deployment_info.clone())
            .collect()
    }
}

/// Where the infrastructure of a deployment ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureOutcome {
    pub kind: String,
    pub connector_ref: String,
    pub infrastructure_key: String,
}

/// A finished deployment, triggering the event-driven path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeploymentEvent {
    pub deployment_summary: DeploymentSummary,
    pub infrastructure_outcome: InfrastructureOutcome,
}

/// Legacy poll response, keyed to exactly one ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponseV1 {
    pub account_id: String,
    pub perpetual_task_id: String,
    pub deployment_type: String,
    pub server_instances: Vec<InstanceInfo>,
    /// Set by the collector when it dropped data to respect response limits.
    #[serde(default)]
    pub truncated: bool,
}

/// Overall execution status of a batched task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Skipped,
}

/// Status of a whole batched response or of one entry inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskStatus {
    /// Successful status with no message.
    pub fn success() -> Self {
        Self {
            execution_status: ExecutionStatus::Success,
            error_message: None,
        }
    }

    /// Failed status with a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            execution_status: ExecutionStatus::Failure,
            error_message: Some(message.into()),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.execution_status == ExecutionStatus::Success
    }
}

/// Instances observed for one ledger entry inside a batched response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSyncData {
    /// Ledger entry id this data belongs to.
    pub task_info_id: String,
    pub status: TaskStatus,
    pub deployment_type: String,
    /// Raw server payload, parsed by the deployment-type handler.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub truncated: bool,
}

/// Batched poll response multiplexing many ledger entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponseV2 {
    pub account_id: String,
    pub perpetual_task_id: String,
    pub status: TaskStatus,
    pub instance_data: Vec<InstanceSyncData>,
}

/// Three pairwise-disjoint mutation lists produced by one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationResult {
    pub to_add: Vec<InstanceRecord>,
    pub to_update: Vec<InstanceRecord>,
    pub to_delete: Vec<InstanceRecord>,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Instance keys of each list, in order add, update, delete.
    pub fn instance_keys(&self) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        let keys = |records: &[InstanceRecord]| {
            records
                .iter()
                .map(|r| r.instance_key.clone())
                .collect::<HashSet<_>>()
        };
        (
            keys(&self.to_add),
            keys(&self.to_update),
            keys(&self.to_delete),
        )
    }
}

/// Stage of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStage {
    Idle,
    LockAcquiring,
    Diffing,
    Applying,
    LedgerUpdating,
    Done,
    Failed,
    TornDown,
}

impl PassStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LockAcquiring => "lock_acquiring",
            Self::Diffing => "diffing",
            Self::Applying => "applying",
            Self::LedgerUpdating => "ledger_updating",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::TornDown => "torn_down",
        }
    }
}

/// A sync key whose additions could not be materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncKeyFailure {
    pub sync_key: String,
    pub error_code: &'static str,
    pub message: String,
}

/// Summary of a completed reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub infrastructure_mapping_id: String,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Stray instances re-pointed from duplicate mappings.
    pub repaired: usize,
    /// Whether the server payload was treated as partial.
    pub partial: bool,
    pub failed_sync_keys: Vec<SyncKeyFailure>,
    /// Whether the ledger entry was deleted because nothing is watched anymore.
    pub ledger_entry_deleted: bool,
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Reconciled(PassReport),
    /// Service, environment or mapping vanished; instances and ledger were removed.
    TornDown {
        infrastructure_mapping_id: String,
        instances_deleted: u64,
    },
    Skipped {
        reason: String,
    },
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
