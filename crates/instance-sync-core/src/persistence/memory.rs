// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local backend for tests and embedded single-node setups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    DeploymentSummary, InfrastructureMapping, InstanceRecord, PerpetualTaskLedgerEntry,
    TaskProtocol,
};

use super::{DeploymentSummaryStore, EntityLookup, InfraMappingStore, InstanceStore, LedgerStore};

#[derive(Default)]
struct State {
    /// Keyed by record id.
    instances: BTreeMap<String, InstanceRecord>,
    summaries: Vec<DeploymentSummary>,
    mappings: HashMap<String, InfrastructureMapping>,
    /// Keyed by entry id.
    ledger: BTreeMap<String, PerpetualTaskLedgerEntry>,
    /// (account, connector) -> batched task id.
    v2_tasks: HashMap<(String, String), String>,
    services: HashSet<String>,
    environments: HashSet<String>,
    connectors: HashSet<(String, String)>,
}

/// In-memory implementation of every persistence trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_service(&self, service_id: &str) {
        self.state().services.insert(service_id.to_string());
    }

    pub fn remove_service(&self, service_id: &str) {
        self.state().services.remove(service_id);
    }

    pub fn add_environment(&self, env_id: &str) {
        self.state().environments.insert(env_id.to_string());
    }

    pub fn remove_environment(&self, env_id: &str) {
        self.state().environments.remove(env_id);
    }

    pub fn add_connector(&self, account_id: &str, connector_ref: &str) {
        self.state()
            .connectors
            .insert((account_id.to_string(), connector_ref.to_string()));
    }

    pub fn remove_connector(&self, account_id: &str, connector_ref: &str) {
        self.state()
            .connectors
            .remove(&(account_id.to_string(), connector_ref.to_string()));
    }

    /// Register a mapping together with its service, environment and connector.
    pub fn seed_mapping(&self, mapping: &InfrastructureMapping) {
        let mut state = self.state();
        state.services.insert(mapping.service_id.clone());
        state.environments.insert(mapping.env_id.clone());
        state
            .connectors
            .insert((mapping.account_id.clone(), mapping.connector_ref.clone()));
        state.mappings.insert(mapping.id.clone(), mapping.clone());
    }

    /// Insert a record as-is, bypassing identity checks.
    pub fn insert_instance(&self, record: InstanceRecord) {
        self.state().instances.insert(record.id.clone(), record);
    }

    /// Snapshot of every stored instance.
    pub fn all_instances(&self) -> Vec<InstanceRecord> {
        self.state().instances.values().cloned().collect()
    }

    /// Snapshot of every ledger entry.
    pub fn all_entries(&self) -> Vec<PerpetualTaskLedgerEntry> {
        self.state().ledger.values().cloned().collect()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn list_by_mapping(
        &self,
        infrastructure_mapping_id: &str,
    ) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .state()
            .instances
            .values()
            .filter(|r| r.infrastructure_mapping_id == infrastructure_mapping_id)
            .cloned()
            .collect())
    }

    async fn list_by_infrastructure_key(
        &self,
        account_id: &str,
        infrastructure_key: &str,
    ) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .state()
            .instances
            .values()
            .filter(|r| r.account_id == account_id && r.infrastructure_key == infrastructure_key)
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
        instance_key: &str,
    ) -> Result<bool> {
        let mut state = self.state();
        let before = state.instances.len();
        state.instances.retain(|_, r| {
            !(r.account_id == account_id
                && r.infrastructure_mapping_id == infrastructure_mapping_id
                && r.instance_key == instance_key)
        });
        Ok(state.instances.len() < before)
    }

    async fn upsert_if_absent(&self, record: &InstanceRecord) -> Result<bool> {
        let mut state = self.state();
        let exists = state.instances.values().any(|r| {
            r.infrastructure_mapping_id == record.infrastructure_mapping_id
                && r.instance_key == record.instance_key
        });
        if exists {
            return Ok(false);
        }
        state.instances.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn replace(&self, record: &InstanceRecord) -> Result<()> {
        self.state()
            .instances
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_all_by_mapping(&self, infrastructure_mapping_id: &str) -> Result<u64> {
        let mut state = self.state();
        let before = state.instances.len();
        state
            .instances
            .retain(|_, r| r.infrastructure_mapping_id != infrastructure_mapping_id);
        Ok((before - state.instances.len()) as u64)
    }
}

#[async_trait]
impl DeploymentSummaryStore for MemoryStore {
    async fn save_summary(&self, summary: &DeploymentSummary) -> Result<()> {
        let mut state = self.state();
        state.summaries.retain(|s| s.id != summary.id);
        state.summaries.push(summary.clone());
        Ok(())
    }

    async fn latest_for_sync_key(
        &self,
        account_id: &str,
        infrastructure_mapping_id: &str,
        sync_key: &str,
    ) -> Result<Option<DeploymentSummary>> {
        Ok(self
            .state()
            .summaries
            .iter()
            .filter(|s| {
                s.account_id == account_id
                    && s.infrastructure_mapping_id == infrastructure_mapping_id
                    && s.instance_sync_key == sync_key
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }
}

#[async_trait]
impl InfraMappingStore for MemoryStore {
    async fn get_mapping(&self, id: &str) -> Result<Option<InfrastructureMapping>> {
        Ok(self.state().mappings.get(id).cloned())
    }

    async fn save_mapping(&self, mapping: &InfrastructureMapping) -> Result<()> {
        self.state()
            .mappings
            .insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }
}

fn bound_to_v2(entry: &PerpetualTaskLedgerEntry, account_id: &str, task_id: &str) -> bool {
    entry.account_id == account_id
        && matches!(&entry.protocol, Some(TaskProtocol::V2 { task_id: t, .. }) if t == task_id)
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_entry(
        &self,
        account_id: &str,
        id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>> {
        Ok(self
            .state()
            .ledger
            .get(id)
            .filter(|e| e.account_id == account_id)
            .cloned())
    }

    async fn get_entry_by_mapping(
        &self,
        infrastructure_mapping_id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>> {
        Ok(self
            .state()
            .ledger
            .values()
            .find(|e| e.infrastructure_mapping_id == infrastructure_mapping_id)
            .cloned())
    }

    async fn get_entry_by_v1_task(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<Option<PerpetualTaskLedgerEntry>> {
        Ok(self
            .state()
            .ledger
            .values()
            .find(|e| {
                e.account_id == account_id
                    && matches!(&e.protocol, Some(TaskProtocol::V1 { task_id: t }) if t == task_id)
            })
            .cloned())
    }

    async fn list_entries_by_v2_task(
        &self,
        account_id: &str,
        task_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>> {
        Ok(self
            .state()
            .ledger
            .values()
            .filter(|e| bound_to_v2(e, account_id, task_id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_entries_after(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PerpetualTaskLedgerEntry>> {
        let state = self.state();
        let entries = state.ledger.values().filter(|e| match after_id {
            Some(after) => e.id.as_str() > after,
            None => true,
        });
        Ok(entries.take(limit).cloned().collect())
    }

    async fn count_entries_by_v2_task(&self, account_id: &str, task_id: &str) -> Result<u64> {
        Ok(self
            .state()
            .ledger
            .values()
            .filter(|e| bound_to_v2(e, account_id, task_id))
            .count() as u64)
    }

    async fn save_entry(&self, entry: &PerpetualTaskLedgerEntry) -> Result<()> {
        self.state().ledger.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn delete_entry(&self, id: &str) -> Result<()> {
        self.state().ledger.remove(id);
        Ok(())
    }

    async fn find_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<Option<String>> {
        Ok(self
            .state()
            .v2_tasks
            .get(&(account_id.to_string(), connector_ref.to_string()))
            .cloned())
    }

    async fn save_v2_task(
        &self,
        account_id: &str,
        connector_ref: &str,
        task_id: &str,
    ) -> Result<()> {
        self.state().v2_tasks.insert(
            (account_id.to_string(), connector_ref.to_string()),
            task_id.to_string(),
        );
        Ok(())
    }

    async fn delete_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<()> {
        self.state()
            .v2_tasks
            .remove(&(account_id.to_string(), connector_ref.to_string()));
        Ok(())
    }
}

#[async_trait]
impl EntityLookup for MemoryStore {
    async fn service_exists(&self, mapping: &InfrastructureMapping) -> Result<bool> {
        Ok(self.state().services.contains(&mapping.service_id))
    }

    async fn environment_exists(&self, mapping: &InfrastructureMapping) -> Result<bool> {
        Ok(self.state().environments.contains(&mapping.env_id))
    }

    async fn connector_exists(&self, account_id: &str, connector_ref: &str) -> Result<bool> {
        Ok(self
            .state()
            .connectors
            .contains(&(account_id.to_string(), connector_ref.to_string())))
    }
}
