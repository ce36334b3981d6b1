// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the perpetual-task service that runs collectors.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::model::{DeploymentInfo, InfrastructureMapping};

/// Creates, resets and deletes collector tasks.
#[async_trait]
pub trait PerpetualTaskClient: Send + Sync {
    /// Start a legacy polling task watching `deployment_infos` on `mapping`.
    async fn create_v1_task(
        &self,
        mapping: &InfrastructureMapping,
        deployment_infos: &[DeploymentInfo],
    ) -> Result<String>;

    /// Replace the watch list of a legacy task.
    async fn reset_v1_task(
        &self,
        account_id: &str,
        task_id: &str,
        deployment_infos: &[DeploymentInfo],
    ) -> Result<()>;

    /// Start a batched task for every mapping on `connector_ref`.
    async fn create_v2_task(&self, account_id: &str, connector_ref: &str) -> Result<String>;

    async fn delete_task(&self, account_id: &str, task_id: &str) -> Result<()>;
}

/// A call observed by [`MemoryTaskClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCall {
    CreateV1 {
        infrastructure_mapping_id: String,
        task_id: String,
        deployment_infos: usize,
    },
    ResetV1 {
        task_id: String,
        deployment_infos: usize,
    },
    CreateV2 {
        connector_ref: String,
        task_id: String,
    },
    Delete {
        task_id: String,
    },
}

#[derive(Default)]
struct MemoryTaskState {
    calls: Vec<TaskCall>,
    live: HashSet<String>,
    fail_deletes: bool,
}

/// Recording client that keeps tasks in memory.
#[derive(Clone, Default)]
pub struct MemoryTaskClient {
    state: Arc<Mutex<MemoryTaskState>>,
}

impl MemoryTaskClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose deletes always fail.
    pub fn failing_deletes() -> Self {
        let client = Self::default();
        client.lock().fail_deletes = true;
        client
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<TaskCall> {
        self.lock().calls.clone()
    }

    pub fn is_live(&self, task_id: &str) -> bool {
        self.lock().live.contains(task_id)
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Number of recorded deletes.
    pub fn delete_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, TaskCall::Delete { .. }))
            .count()
    }
}

#[async_trait]
impl PerpetualTaskClient for MemoryTaskClient {
    async fn create_v1_task(
        &self,
        mapping: &InfrastructureMapping,
        deployment_infos: &[DeploymentInfo],
    ) -> Result<String> {
        let task_id = format!("v1-{}", Uuid::new_v4());
        let mut state = self.lock();
        state.live.insert(task_id.clone());
        state.calls.push(TaskCall::CreateV1 {
            infrastructure_mapping_id: mapping.id.clone(),
            task_id: task_id.clone(),
            deployment_infos: deployment_infos.len(),
        });
        Ok(task_id)
    }

    async fn reset_v1_task(
        &self,
        _account_id: &str,
        task_id: &str,
        deployment_infos: &[DeploymentInfo],
    ) -> Result<()> {
        self.lock().calls.push(TaskCall::ResetV1 {
            task_id: task_id.to_string(),
            deployment_infos: deployment_infos.len(),
        });
        Ok(())
    }

    async fn create_v2_task(&self, _account_id: &str, connector_ref: &str) -> Result<String> {
        let task_id = format!("v2-{}", Uuid::new_v4());
        let mut state = self.lock();
        state.live.insert(task_id.clone());
        state.calls.push(TaskCall::CreateV2 {
            connector_ref: connector_ref.to_string(),
            task_id: task_id.clone(),
        });
        Ok(task_id)
    }

    async fn delete_task(&self, _account_id: &str, task_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(SyncError::store("delete_task", "perpetual task service unavailable"));
        }
        state.live.remove(task_id);
        state.calls.push(TaskCall::Delete {
            task_id: task_id.to_string(),
        });
        Ok(())
    }
}
