// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation coordinator.
//!
//! [`InstanceSyncService`] runs one pass per infrastructure mapping:
//!
//! ```text
//! Idle -> LockAcquiring -> Diffing -> Applying -> LedgerUpdating -> Done
//!   \-> Failed (lock timeout, store failure)
//!   \-> TornDown (mapping, service or environment gone)
//! ```
//!
//! Event-driven passes retry the whole state machine on retryable errors.
//! Poll-driven passes never retry; the next poll re-attempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::InstanceSyncConfig;
use crate::diff::{DiffEngine, PassOrigin};
use crate::error::{Result, SyncError};
use crate::grouper::{GroupedSnapshot, SyncKeyGrouper};
use crate::handler::{HandlerRegistry, InstanceSyncHandler};
use crate::ledger::{ObservationOutcome, PerpetualTaskLedger};
use crate::lock::{LockManager, MemoryLockManager, PersistentLocker};
use crate::model::{
    DeploymentSummary, ExecutionStatus, InfrastructureMapping, InstanceInfo, InstanceSyncData,
    NewDeploymentEvent, PassOutcome, PassReport, PassStage, PerpetualTaskLedgerEntry,
    PollResponseV1, PollResponseV2, ReconciliationResult,
};
use crate::monitor::{SyncMonitor, TracingMonitor};
use crate::perpetual_task::PerpetualTaskClient;
use crate::persistence::{
    DeploymentSummaryStore, EntityLookup, InfraMappingStore, InstanceStore, LedgerStore,
    MemoryStore,
};
use crate::summary_cache::{SummaryCache, SummaryCacheKey, SummaryResolver};

/// Page size used when loading every entry of a batched task.
const V2_ENTRY_PAGE_SIZE: usize = 100;

/// One ledger entry of a batched response that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub task_info_id: String,
    pub error_code: &'static str,
    pub message: String,
}

/// What happened to each entry of a batched response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub perpetual_task_id: String,
    /// The collector skipped this run; nothing was touched.
    pub skipped: bool,
    pub outcomes: Vec<(String, PassOutcome)>,
    pub failures: Vec<EntryFailure>,
    /// Entries deleted because their task had been failing too long.
    pub cleaned_up: Vec<String>,
}

impl BatchReport {
    fn new(perpetual_task_id: &str) -> Self {
        Self {
            perpetual_task_id: perpetual_task_id.to_string(),
            ..Default::default()
        }
    }

    fn fail(&mut self, task_info_id: &str, error_code: &'static str, message: impl Into<String>) {
        self.failures.push(EntryFailure {
            task_info_id: task_info_id.to_string(),
            error_code,
            message: message.into(),
        });
    }
}

/// What a collector needs to watch one ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDetails {
    pub task_info_id: String,
    pub infrastructure_mapping_id: String,
    pub deployment_type: Option<String>,
    pub release_details: Vec<Value>,
}

enum PassTrigger<'a> {
    NewDeployment {
        summary: &'a DeploymentSummary,
        use_batched: bool,
    },
    Poll {
        truncated: bool,
    },
}

struct PassContext<'a> {
    mapping: &'a InfrastructureMapping,
    handler: &'a dyn InstanceSyncHandler,
    server_instances: Vec<InstanceInfo>,
    trigger: PassTrigger<'a>,
}

struct PassTracker<'a> {
    infrastructure_mapping_id: &'a str,
    stage: PassStage,
}

impl<'a> PassTracker<'a> {
    fn new(infrastructure_mapping_id: &'a str) -> Self {
        Self {
            infrastructure_mapping_id,
            stage: PassStage::Idle,
        }
    }

    fn advance(&mut self, next: PassStage) {
        debug!(
            infrastructure_mapping_id = self.infrastructure_mapping_id,
            from = self.stage.name(),
            to = next.name(),
            "Pass stage transition"
        );
        self.stage = next;
    }
}

/// Reconciles instance inventories against deployment events and collector reports.
pub struct InstanceSyncService {
    config: InstanceSyncConfig,
    handlers: HandlerRegistry,
    instances: Arc<dyn InstanceStore>,
    summaries: Arc<dyn DeploymentSummaryStore>,
    mappings: Arc<dyn InfraMappingStore>,
    ledger_store: Arc<dyn LedgerStore>,
    entities: Arc<dyn EntityLookup>,
    tasks: Arc<dyn PerpetualTaskClient>,
    ledger: PerpetualTaskLedger,
    locker: PersistentLocker,
    cache: SummaryCache,
    monitor: Arc<dyn SyncMonitor>,
    clock: Arc<dyn Clock>,
}

impl InstanceSyncService {
    pub fn builder() -> InstanceSyncServiceBuilder {
        InstanceSyncServiceBuilder::default()
    }

    pub fn config(&self) -> &InstanceSyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &PerpetualTaskLedger {
        &self.ledger
    }

    pub fn summary_cache(&self) -> &SummaryCache {
        &self.cache
    }

    /// Reconcile after a deployment finished, retrying retryable failures.
    pub async fn process_new_deployment(&self, event: &NewDeploymentEvent) -> Result<PassOutcome> {
        let summary = &event.deployment_summary;
        let Some(mapping) = self
            .mappings
            .get_mapping(&summary.infrastructure_mapping_id)
            .await?
        else {
            warn!(
                infrastructure_mapping_id = %summary.infrastructure_mapping_id,
                "Infrastructure mapping not found for new deployment"
            );
            return self
                .tear_down_orphan(&summary.account_id, &summary.infrastructure_mapping_id)
                .await;
        };
        let handler = self
            .handlers
            .get(&summary.deployment_info.deployment_type, &mapping.infrastructure_kind)?;
        let use_batched = self.config.batched_protocol_enabled
            && handler.supports_batched_protocol(&mapping.account_id);

        let cache_key = SummaryCacheKey::of(summary);
        self.cache.put(summary.clone());
        self.summaries.save_summary(summary).await?;

        let attempts = self.config.new_deployment_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self
                .run_pass(PassContext {
                    mapping: &mapping,
                    handler: handler.as_ref(),
                    server_instances: summary.server_instances.clone(),
                    trigger: PassTrigger::NewDeployment {
                        summary,
                        use_batched,
                    },
                })
                .await;
            self.monitor
                .record_pass(&mapping.account_id, true, result.is_ok(), started.elapsed());

            match result {
                Ok(outcome) => {
                    self.cache.invalidate(&cache_key);
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        infrastructure_mapping_id = %mapping.id,
                        attempt,
                        error = %e,
                        "New deployment pass failed, retrying"
                    );
                }
                Err(e) => {
                    error!(
                        infrastructure_mapping_id = %mapping.id,
                        attempt,
                        error_code = e.error_code(),
                        error = %e,
                        "New deployment pass abandoned"
                    );
                    self.cache.invalidate(&cache_key);
                    return Err(e);
                }
            }
        }
    }

    /// Reconcile a legacy poll response. Failures are not retried.
    pub async fn process_poll_response(&self, response: &PollResponseV1) -> Result<PassOutcome> {
        let started = Instant::now();
        let result = self.handle_poll_v1(response).await;
        self.monitor
            .record_pass(&response.account_id, false, result.is_ok(), started.elapsed());
        if let Err(e) = &result {
            warn!(
                perpetual_task_id = %response.perpetual_task_id,
                error_code = e.error_code(),
                error = %e,
                "Poll pass failed"
            );
        }
        result
    }

    async fn handle_poll_v1(&self, response: &PollResponseV1) -> Result<PassOutcome> {
        let Some(entry) = self
            .ledger_store
            .get_entry_by_v1_task(&response.account_id, &response.perpetual_task_id)
            .await?
        else {
            warn!(
                perpetual_task_id = %response.perpetual_task_id,
                "No ledger entry for perpetual task, deleting it"
            );
            self.tasks
                .delete_task(&response.account_id, &response.perpetual_task_id)
                .await?;
            return Ok(PassOutcome::Skipped {
                reason: format!(
                    "no ledger entry for perpetual task '{}'",
                    response.perpetual_task_id
                ),
            });
        };

        let Some(mapping) = self
            .mappings
            .get_mapping(&entry.infrastructure_mapping_id)
            .await?
        else {
            return self
                .tear_down_orphan(&entry.account_id, &entry.infrastructure_mapping_id)
                .await;
        };
        let handler = self
            .handlers
            .get(&response.deployment_type, &mapping.infrastructure_kind)?;

        self.run_pass(PassContext {
            mapping: &mapping,
            handler: handler.as_ref(),
            server_instances: response.server_instances.clone(),
            trigger: PassTrigger::Poll {
                truncated: response.truncated,
            },
        })
        .await
    }

    /// Reconcile every entry of a batched response, one entry at a time.
    ///
    /// Per-entry failures are reported, never propagated. Only loading the
    /// task's entries can fail the whole call.
    pub async fn process_poll_response_v2(&self, response: &PollResponseV2) -> Result<BatchReport> {
        let mut report = BatchReport::new(&response.perpetual_task_id);

        if response.status.execution_status == ExecutionStatus::Skipped {
            debug!(perpetual_task_id = %response.perpetual_task_id, "Batched task run skipped");
            report.skipped = true;
            return Ok(report);
        }

        let entries = self
            .entries_for_v2_task(&response.account_id, &response.perpetual_task_id)
            .await?;
        let by_id: HashMap<&str, &PerpetualTaskLedgerEntry> =
            entries.iter().map(|e| (e.id.as_str(), e)).collect();

        if !response.status.is_successful() {
            warn!(
                perpetual_task_id = %response.perpetual_task_id,
                error_message = response.status.error_message.as_deref().unwrap_or(""),
                entries = entries.len(),
                "Batched task run failed"
            );
            for entry in &entries {
                self.cleanup_failing_entry(&entry.account_id, &entry.id, &mut report)
                    .await;
            }
            return Ok(report);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for data in &response.instance_data {
            let task_info_id = data.task_info_id.as_str();

            if !seen.insert(task_info_id) {
                warn!(task_info_id, "Duplicate task info in batched response");
                report.fail(task_info_id, "DUPLICATE_TASK_INFO", "duplicate task info id");
                if by_id.contains_key(task_info_id) {
                    self.cleanup_failing_entry(&response.account_id, task_info_id, &mut report)
                        .await;
                }
                continue;
            }

            let Some(entry) = by_id.get(task_info_id) else {
                warn!(
                    task_info_id,
                    perpetual_task_id = %response.perpetual_task_id,
                    "Unknown task info in batched response"
                );
                report.fail(task_info_id, "UNKNOWN_TASK_INFO", "no ledger entry for task info id");
                continue;
            };

            if !data.status.is_successful() {
                let message = data.status.error_message.clone().unwrap_or_default();
                warn!(task_info_id, error_message = %message, "Collector failed for entry");
                report.fail(task_info_id, "ENTRY_FAILED", message);
                self.cleanup_failing_entry(&entry.account_id, task_info_id, &mut report)
                    .await;
                continue;
            }

            let started = Instant::now();
            let result = self.handle_instance_sync_data(entry, data).await;
            self.monitor
                .record_pass(&entry.account_id, false, result.is_ok(), started.elapsed());
            match result {
                Ok(outcome) => report.outcomes.push((task_info_id.to_string(), outcome)),
                Err(e) => {
                    warn!(
                        task_info_id,
                        infrastructure_mapping_id = %entry.infrastructure_mapping_id,
                        error_code = e.error_code(),
                        error = %e,
                        "Batched entry pass failed"
                    );
                    report.fail(task_info_id, e.error_code(), e.to_string());
                }
            }
        }

        for entry in &entries {
            if !seen.contains(entry.id.as_str()) {
                debug!(task_info_id = %entry.id, "Entry missing from batched response");
                self.cleanup_failing_entry(&entry.account_id, &entry.id, &mut report)
                    .await;
            }
        }

        info!(
            perpetual_task_id = %response.perpetual_task_id,
            reconciled = report.outcomes.len(),
            failed = report.failures.len(),
            cleaned_up = report.cleaned_up.len(),
            "Processed batched response"
        );
        Ok(report)
    }

    async fn handle_instance_sync_data(
        &self,
        entry: &PerpetualTaskLedgerEntry,
        data: &InstanceSyncData,
    ) -> Result<PassOutcome> {
        let Some(mapping) = self
            .mappings
            .get_mapping(&entry.infrastructure_mapping_id)
            .await?
        else {
            return self
                .tear_down_orphan(&entry.account_id, &entry.infrastructure_mapping_id)
                .await;
        };
        let handler = self
            .handlers
            .get(&data.deployment_type, &mapping.infrastructure_kind)?;
        let server_instances = handler.parse_server_payload(&data.payload)?;

        self.run_pass(PassContext {
            mapping: &mapping,
            handler: handler.as_ref(),
            server_instances,
            trigger: PassTrigger::Poll {
                truncated: data.truncated,
            },
        })
        .await
    }

    /// Page the entries bound to a batched task for its collector.
    pub async fn fetch_task_details(
        &self,
        account_id: &str,
        perpetual_task_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Vec<TaskDetails>> {
        let entries = self
            .ledger_store
            .list_entries_by_v2_task(
                account_id,
                perpetual_task_id,
                page.saturating_mul(size),
                size,
            )
            .await?;

        let mut details = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(mapping) = self
                .mappings
                .get_mapping(&entry.infrastructure_mapping_id)
                .await?
            else {
                warn!(
                    task_info_id = %entry.id,
                    infrastructure_mapping_id = %entry.infrastructure_mapping_id,
                    "Skipping task details for missing mapping"
                );
                continue;
            };

            let mut release_details = Vec::with_capacity(entry.deployment_info_details.len());
            for detail in &entry.deployment_info_details {
                let info = &detail.deployment_info;
                match self
                    .handlers
                    .get(&info.deployment_type, &mapping.infrastructure_kind)
                {
                    Ok(handler) => release_details.push(handler.release_details(info)),
                    Err(e) => warn!(task_info_id = %entry.id, error = %e, "Skipping release details"),
                }
            }

            details.push(TaskDetails {
                deployment_type: entry
                    .deployment_info_details
                    .first()
                    .map(|d| d.deployment_info.deployment_type.clone()),
                task_info_id: entry.id,
                infrastructure_mapping_id: entry.infrastructure_mapping_id,
                release_details,
            });
        }
        Ok(details)
    }

    async fn entries_for_v2_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>> {
        let mut entries = Vec::new();
        loop {
            let page = self
                .ledger_store
                .list_entries_by_v2_task(account_id, task_id, entries.len(), V2_ENTRY_PAGE_SIZE)
                .await?;
            let last_page = page.len() < V2_ENTRY_PAGE_SIZE;
            entries.extend(page);
            if last_page {
                return Ok(entries);
            }
        }
    }

    async fn cleanup_failing_entry(
        &self,
        account_id: &str,
        entry_id: &str,
        report: &mut BatchReport,
    ) {
        match self
            .ledger
            .cleanup_entry_if_stale_failing(account_id, entry_id)
            .await
        {
            Ok(true) => report.cleaned_up.push(entry_id.to_string()),
            Ok(false) => {}
            Err(e) => warn!(task_info_id = entry_id, error = %e, "Stale failing cleanup failed"),
        }
    }

    async fn run_pass(&self, ctx: PassContext<'_>) -> Result<PassOutcome> {
        let mapping = ctx.mapping;
        let mut tracker = PassTracker::new(&mapping.id);
        let result = self.run_pass_stages(&mut tracker, ctx).await;
        if let Err(e) = &result {
            let failed_at = tracker.stage;
            tracker.advance(PassStage::Failed);
            warn!(
                infrastructure_mapping_id = tracker.infrastructure_mapping_id,
                stage = failed_at.name(),
                error_code = e.error_code(),
                "Reconciliation pass failed"
            );
        }
        result
    }

    async fn run_pass_stages(
        &self,
        tracker: &mut PassTracker<'_>,
        ctx: PassContext<'_>,
    ) -> Result<PassOutcome> {
        let PassContext {
            mapping,
            handler,
            server_instances,
            trigger,
        } = ctx;

        tracker.advance(PassStage::LockAcquiring);
        let _lock = self
            .locker
            .acquire(
                &self.config.lock_key(&mapping.id),
                self.config.lock_wait_timeout,
                self.config.lock_hold_timeout,
            )
            .await?;

        if let Some(missing) = self.missing_owner(mapping).await? {
            tracker.advance(PassStage::TornDown);
            let err = SyncError::ServiceOrEnvNotFound {
                infrastructure_mapping_id: mapping.id.clone(),
                entity: missing,
            };
            warn!(infrastructure_mapping_id = %mapping.id, "{}, tearing down", err);
            return self.tear_down(&mapping.id).await;
        }

        let repaired = self.repair_corrupted_instances(mapping).await?;

        tracker.advance(PassStage::Diffing);
        let observed = server_instances.len();
        let records = self.instances.list_by_mapping(&mapping.id).await?;
        let snapshot = SyncKeyGrouper::group(handler, records, server_instances);
        let (origin, partial) = match &trigger {
            PassTrigger::NewDeployment { summary, .. } => {
                (PassOrigin::NewDeployment(*summary), false)
            }
            PassTrigger::Poll { truncated } => {
                let partial = self.is_partial(*truncated, observed, &snapshot);
                (PassOrigin::Poll { partial }, partial)
            }
        };
        if partial {
            info!(
                infrastructure_mapping_id = %mapping.id,
                observed,
                sync_keys = snapshot.server.len(),
                "Partial poll payload, vanished sync keys are kept"
            );
        }
        let plans = DiffEngine::plan(handler, &snapshot, origin);
        let resolver = SummaryResolver::new(&self.cache, self.summaries.as_ref());
        let diff = DiffEngine::materialize(
            handler,
            mapping,
            plans,
            origin,
            &resolver,
            self.clock.now(),
        )
        .await;

        tracker.advance(PassStage::Applying);
        let (added, updated, deleted) = self.apply(&diff.result).await?;

        tracker.advance(PassStage::LedgerUpdating);
        let ledger_entry_deleted = match trigger {
            PassTrigger::NewDeployment {
                summary,
                use_batched,
            } => {
                self.ledger
                    .track_deployment(mapping, handler, &summary.deployment_info, use_batched)
                    .await?;
                false
            }
            PassTrigger::Poll { .. } => {
                self.observe_poll(mapping, handler, &snapshot).await?
            }
        };

        tracker.advance(PassStage::Done);
        info!(
            infrastructure_mapping_id = %mapping.id,
            added,
            updated,
            deleted,
            repaired,
            failed_sync_keys = diff.failures.len(),
            "Reconciled instances"
        );
        Ok(PassOutcome::Reconciled(PassReport {
            infrastructure_mapping_id: mapping.id.clone(),
            added,
            updated,
            deleted,
            repaired,
            partial,
            failed_sync_keys: diff.failures,
            ledger_entry_deleted,
        }))
    }

    /// Record a successful collector run and prune the watched deployment infos.
    ///
    /// Returns whether the entry was deleted.
    async fn observe_poll(
        &self,
        mapping: &InfrastructureMapping,
        handler: &dyn InstanceSyncHandler,
        snapshot: &GroupedSnapshot,
    ) -> Result<bool> {
        let Some(mut entry) = self.ledger_store.get_entry_by_mapping(&mapping.id).await? else {
            debug!(infrastructure_mapping_id = %mapping.id, "Ledger entry vanished during pass");
            return Ok(false);
        };
        let seen: HashSet<String> = snapshot.server.keys().map(str::to_string).collect();
        entry.last_successful_run = Some(self.clock.now());
        let outcome = self
            .ledger
            .record_observation(&mut entry, handler, &seen)
            .await?;
        Ok(outcome == ObservationOutcome::Deleted)
    }

    fn is_partial(&self, truncated: bool, observed: usize, snapshot: &GroupedSnapshot) -> bool {
        truncated
            || (self.config.max_instances_per_entry > 0
                && observed >= self.config.max_instances_per_entry)
            || (self.config.max_releases_per_entry > 0
                && snapshot.server.len() >= self.config.max_releases_per_entry)
    }

    /// Delete, then add, then update.
    async fn apply(&self, result: &ReconciliationResult) -> Result<(usize, usize, usize)> {
        let mut deleted = 0;
        for record in &result.to_delete {
            if self
                .instances
                .delete(
                    &record.account_id,
                    &record.infrastructure_mapping_id,
                    &record.instance_key,
                )
                .await?
            {
                deleted += 1;
            }
        }

        let mut added = 0;
        for record in &result.to_add {
            if self.instances.upsert_if_absent(record).await? {
                added += 1;
            } else {
                debug!(instance_key = %record.instance_key, "Instance already present, skipping add");
            }
        }

        for record in &result.to_update {
            self.instances.replace(record).await?;
        }

        Ok((added, result.to_update.len(), deleted))
    }

    async fn missing_owner(&self, mapping: &InfrastructureMapping) -> Result<Option<&'static str>> {
        if !self.entities.service_exists(mapping).await? {
            return Ok(Some("Service"));
        }
        if !self.entities.environment_exists(mapping).await? {
            return Ok(Some("Environment"));
        }
        Ok(None)
    }

    /// Re-point instances left on duplicate mappings of the same infrastructure.
    async fn repair_corrupted_instances(&self, mapping: &InfrastructureMapping) -> Result<usize> {
        let strays: Vec<_> = self
            .instances
            .list_by_infrastructure_key(&mapping.account_id, &mapping.infrastructure_key)
            .await?
            .into_iter()
            .filter(|r| r.infrastructure_mapping_id != mapping.id)
            .collect();
        if strays.is_empty() {
            return Ok(0);
        }

        let mut canonical: HashSet<String> = self
            .instances
            .list_by_mapping(&mapping.id)
            .await?
            .into_iter()
            .map(|r| r.instance_key)
            .collect();

        let now = self.clock.now();
        let repaired = strays.len();
        for mut stray in strays {
            if canonical.contains(&stray.instance_key) {
                self.instances
                    .delete(
                        &stray.account_id,
                        &stray.infrastructure_mapping_id,
                        &stray.instance_key,
                    )
                    .await?;
                continue;
            }
            stray.infrastructure_mapping_id = mapping.id.clone();
            stray.service_id = mapping.service_id.clone();
            stray.env_id = mapping.env_id.clone();
            stray.connector_ref = mapping.connector_ref.clone();
            stray.infrastructure_kind = mapping.infrastructure_kind.clone();
            stray.last_modified_at = now;
            self.instances.replace(&stray).await?;
            canonical.insert(stray.instance_key);
        }

        info!(
            infrastructure_mapping_id = %mapping.id,
            infrastructure_key = %mapping.infrastructure_key,
            repaired,
            "Re-pointed instances from duplicate infrastructure mappings"
        );
        Ok(repaired)
    }

    /// Tear down under the mapping lock when the mapping itself is gone.
    async fn tear_down_orphan(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
    ) -> Result<PassOutcome> {
        let _lock = self
            .locker
            .acquire(
                &self.config.lock_key(infrastructure_mapping_id),
                self.config.lock_wait_timeout,
                self.config.lock_hold_timeout,
            )
            .await?;
        warn!(
            account_id,
            infrastructure_mapping_id,
            "{}, tearing down",
            SyncError::InfraMappingNotFound(infrastructure_mapping_id.to_string())
        );
        self.tear_down(infrastructure_mapping_id).await
    }

    /// Delete every instance and the ledger entry of a mapping. Caller holds the lock.
    async fn tear_down(&self, infrastructure_mapping_id: &str) -> Result<PassOutcome> {
        let instances_deleted = self
            .instances
            .delete_all_by_mapping(infrastructure_mapping_id)
            .await?;
        if let Some(entry) = self
            .ledger_store
            .get_entry_by_mapping(infrastructure_mapping_id)
            .await?
        {
            self.ledger.delete_entry(&entry).await?;
        }
        info!(infrastructure_mapping_id, instances_deleted, "Tore down infrastructure mapping");
        Ok(PassOutcome::TornDown {
            infrastructure_mapping_id: infrastructure_mapping_id.to_string(),
            instances_deleted,
        })
    }
}

/// Builder for [`InstanceSyncService`].
#[derive(Default)]
pub struct InstanceSyncServiceBuilder {
    config: Option<InstanceSyncConfig>,
    handlers: Option<HandlerRegistry>,
    instances: Option<Arc<dyn InstanceStore>>,
    summaries: Option<Arc<dyn DeploymentSummaryStore>>,
    mappings: Option<Arc<dyn InfraMappingStore>>,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    entities: Option<Arc<dyn EntityLookup>>,
    tasks: Option<Arc<dyn PerpetualTaskClient>>,
    locks: Option<Arc<dyn LockManager>>,
    lock_poll_interval: Option<Duration>,
    monitor: Option<Arc<dyn SyncMonitor>>,
    clock: Option<Arc<dyn Clock>>,
}

impl InstanceSyncServiceBuilder {
    pub fn config(mut self, config: InstanceSyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instances = Some(store);
        self
    }

    pub fn summary_store(mut self, store: Arc<dyn DeploymentSummaryStore>) -> Self {
        self.summaries = Some(store);
        self
    }

    pub fn mapping_store(mut self, store: Arc<dyn InfraMappingStore>) -> Self {
        self.mappings = Some(store);
        self
    }

    pub fn ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    pub fn entity_lookup(mut self, lookup: Arc<dyn EntityLookup>) -> Self {
        self.entities = Some(lookup);
        self
    }

    /// Use one in-memory store for every persistence concern.
    pub fn memory_store(self, store: Arc<MemoryStore>) -> Self {
        self.instance_store(store.clone())
            .summary_store(store.clone())
            .mapping_store(store.clone())
            .ledger_store(store.clone())
            .entity_lookup(store)
    }

    pub fn task_client(mut self, tasks: Arc<dyn PerpetualTaskClient>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = Some(interval);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn SyncMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<InstanceSyncService> {
        let config = self.config.unwrap_or_default();
        let handlers = self
            .handlers
            .ok_or_else(|| SyncError::Config("handlers are required".to_string()))?;
        let instances = self
            .instances
            .ok_or_else(|| SyncError::Config("instance store is required".to_string()))?;
        let summaries = self
            .summaries
            .ok_or_else(|| SyncError::Config("summary store is required".to_string()))?;
        let mappings = self
            .mappings
            .ok_or_else(|| SyncError::Config("mapping store is required".to_string()))?;
        let ledger_store = self
            .ledger_store
            .ok_or_else(|| SyncError::Config("ledger store is required".to_string()))?;
        let entities = self
            .entities
            .ok_or_else(|| SyncError::Config("entity lookup is required".to_string()))?;
        let tasks = self
            .tasks
            .ok_or_else(|| SyncError::Config("task client is required".to_string()))?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let locks: Arc<dyn LockManager> = self
            .locks
            .unwrap_or_else(|| Arc::new(MemoryLockManager::new()));
        let mut locker = PersistentLocker::new(locks);
        if let Some(interval) = self.lock_poll_interval {
            locker = locker.with_poll_interval(interval);
        }

        let ledger = PerpetualTaskLedger::new(
            ledger_store.clone(),
            tasks.clone(),
            entities.clone(),
            clock.clone(),
            locker.clone(),
            &config,
        );
        let cache = SummaryCache::new(
            config.summary_cache_ttl,
            config.summary_cache_capacity,
            clock.clone(),
        );

        Ok(InstanceSyncService {
            handlers,
            instances,
            summaries,
            mappings,
            ledger_store,
            entities,
            tasks,
            ledger,
            locker,
            cache,
            monitor: self.monitor.unwrap_or_else(|| Arc::new(TracingMonitor)),
            clock,
            config,
        })
    }
}
