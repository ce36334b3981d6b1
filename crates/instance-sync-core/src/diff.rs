// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-sync-key diff between persisted and observed instances.
//!
//! Diffing runs in two steps. [`DiffEngine::plan`] is pure: it compares
//! instance keys per sync key and decides what to add, update and delete.
//! [`DiffEngine::materialize`] turns the plan into records, resolving a
//! deployment summary for each sync key that gains instances.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::grouper::GroupedSnapshot;
use crate::handler::InstanceSyncHandler;
use crate::model::{
    DeploymentSummary, InfrastructureMapping, InstanceInfo, InstanceRecord, ReconciliationResult,
    SyncKeyFailure,
};
use crate::summary_cache::SummaryResolver;

/// What triggered a pass.
#[derive(Debug, Clone, Copy)]
pub enum PassOrigin<'a> {
    /// A deployment just finished; the summary describes it.
    NewDeployment(&'a DeploymentSummary),
    /// A perpetual task reported. `partial` payloads never prune whole sync keys.
    Poll { partial: bool },
}

impl PassOrigin<'_> {
    pub fn is_event_driven(&self) -> bool {
        matches!(self, Self::NewDeployment(_))
    }

    fn prunes_vanished_keys(&self) -> bool {
        matches!(self, Self::Poll { partial: false })
    }
}

/// Key-level decisions for one sync key.
#[derive(Debug, Clone, Default)]
pub struct SyncKeyPlan {
    pub sync_key: String,
    /// Observed instances with no persisted record, by instance key.
    pub to_add: Vec<(String, InstanceInfo)>,
    /// Persisted records paired with their fresh observation.
    pub to_update: Vec<(InstanceRecord, InstanceInfo)>,
    pub to_delete: Vec<InstanceRecord>,
    /// Every persisted record of the sync key before the pass.
    pub existing: Vec<InstanceRecord>,
}

impl SyncKeyPlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Materialized mutations plus the sync keys that could not be fully materialized.
#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub result: ReconciliationResult,
    pub failures: Vec<SyncKeyFailure>,
}

pub struct DiffEngine;

impl DiffEngine {
    /// Compare both sides of `snapshot` key by key.
    pub fn plan(
        handler: &dyn InstanceSyncHandler,
        snapshot: &GroupedSnapshot,
        origin: PassOrigin<'_>,
    ) -> Vec<SyncKeyPlan> {
        snapshot
            .all_sync_keys()
            .into_iter()
            .map(|sync_key| Self::plan_key(handler, snapshot, &sync_key, origin))
            .collect()
    }

    fn plan_key(
        handler: &dyn InstanceSyncHandler,
        snapshot: &GroupedSnapshot,
        sync_key: &str,
        origin: PassOrigin<'_>,
    ) -> SyncKeyPlan {
        let existing = snapshot.db.get(sync_key).to_vec();
        let mut plan = SyncKeyPlan {
            sync_key: sync_key.to_string(),
            existing: existing.clone(),
            ..Default::default()
        };

        if !snapshot.server.contains(sync_key) {
            if origin.prunes_vanished_keys() {
                debug!(sync_key, count = existing.len(), "Sync key vanished from server, deleting its instances");
                plan.to_delete = existing;
            }
            return plan;
        }

        let mut db_by_key: BTreeMap<String, InstanceRecord> = BTreeMap::new();
        for record in existing {
            let key = handler
                .instance_key(&record.instance_info)
                .unwrap_or_else(|_| record.instance_key.clone());
            db_by_key.insert(key, record);
        }

        let mut server_by_key: BTreeMap<String, InstanceInfo> = BTreeMap::new();
        for info in snapshot.server.get(sync_key) {
            match handler.instance_key(info) {
                Ok(key) => {
                    server_by_key.insert(key, info.clone());
                }
                Err(e) => warn!(sync_key, error = %e, "Skipping observed instance without an instance key"),
            }
        }

        for (key, record) in db_by_key {
            match server_by_key.remove(&key) {
                Some(observed) => plan.to_update.push((record, observed)),
                None => plan.to_delete.push(record),
            }
        }
        plan.to_add = server_by_key.into_iter().collect();
        plan
    }

    /// Build records for `plans`.
    pub async fn materialize(
        handler: &dyn InstanceSyncHandler,
        mapping: &InfrastructureMapping,
        plans: Vec<SyncKeyPlan>,
        origin: PassOrigin<'_>,
        resolver: &SummaryResolver<'_>,
        now: DateTime<Utc>,
    ) -> DiffOutcome {
        let mut outcome = DiffOutcome::default();

        for plan in plans {
            outcome.result.to_delete.extend(plan.to_delete);

            for (mut record, observed) in plan.to_update {
                record.instance_info = handler.merge_instance(&record.instance_info, &observed);
                record.last_modified_at = now;
                if let PassOrigin::NewDeployment(summary) = origin {
                    record.metadata = summary.metadata.clone();
                    if summary.org_id.is_some() {
                        record.org_id = summary.org_id.clone();
                    }
                    if summary.project_id.is_some() {
                        record.project_id = summary.project_id.clone();
                    }
                }
                outcome.result.to_update.push(record);
            }

            if plan.to_add.is_empty() {
                continue;
            }

            let resolved = match resolver
                .resolve(mapping, &plan.sync_key, &plan.existing, origin.is_event_driven())
                .await
            {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(
                        infrastructure_mapping_id = %mapping.id,
                        sync_key = %plan.sync_key,
                        skipped = plan.to_add.len(),
                        error = %e,
                        "Cannot add instances for sync key"
                    );
                    outcome.failures.push(SyncKeyFailure {
                        sync_key: plan.sync_key.clone(),
                        error_code: e.error_code(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            for (instance_key, info) in plan.to_add {
                let mut record = InstanceRecord::new(
                    mapping,
                    handler.deployment_type(),
                    instance_key,
                    info,
                    resolved.metadata.clone(),
                    now,
                );
                if resolved.org_id.is_some() {
                    record.org_id = resolved.org_id.clone();
                }
                if resolved.project_id.is_some() {
                    record.project_id = resolved.project_id.clone();
                }
                outcome.result.to_add.push(record);
            }
        }

        outcome
    }
}
