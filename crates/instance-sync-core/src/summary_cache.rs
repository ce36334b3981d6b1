// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived deployment summary cache and the resolution policy for new instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::model::{DeploymentMetadata, DeploymentSummary, InfrastructureMapping, InstanceRecord};
use crate::persistence::DeploymentSummaryStore;

struct CachedSummary {
    summary: DeploymentSummary,
    inserted_at: DateTime<Utc>,
}

/// Identifies one deployment unit on one infrastructure mapping.
///
/// The same sync key (e.g. a release name) can be deployed to several
/// mappings and accounts at once, so the mapping and account are part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SummaryCacheKey {
    pub account_id: String,
    pub infrastructure_mapping_id: String,
    pub instance_sync_key: String,
}

impl SummaryCacheKey {
    pub fn new(mapping: &InfrastructureMapping, sync_key: &str) -> Self {
        Self {
            account_id: mapping.account_id.clone(),
            infrastructure_mapping_id: mapping.id.clone(),
            instance_sync_key: sync_key.to_string(),
        }
    }

    pub fn of(summary: &DeploymentSummary) -> Self {
        Self {
            account_id: summary.account_id.clone(),
            infrastructure_mapping_id: summary.infrastructure_mapping_id.clone(),
            instance_sync_key: summary.instance_sync_key.clone(),
        }
    }
}

/// Bounded, TTL-limited cache of deployment summaries keyed by [`SummaryCacheKey`].
pub struct SummaryCache {
    ttl: chrono::Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<SummaryCacheKey, CachedSummary>>,
}

impl SummaryCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            capacity: capacity.max(1),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace the summary for its account, mapping and sync key.
    pub fn put(&self, summary: DeploymentSummary) {
        let now = self.clock.now();
        let key = SummaryCacheKey::of(&summary);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, cached| now - cached.inserted_at < ttl);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CachedSummary {
                summary,
                inserted_at: now,
            },
        );
    }

    /// Live summary for `key`, if any.
    pub fn get(&self, key: &SummaryCacheKey) -> Option<DeploymentSummary> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(cached) if now - cached.inserted_at < self.ttl => Some(cached.summary.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn invalidate(&self, key: &SummaryCacheKey) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a resolved summary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Cache,
    Sibling,
    Store,
}

/// Metadata to stamp onto newly added instances of one sync key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSummary {
    pub metadata: DeploymentMetadata,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub source: SummarySource,
}

impl ResolvedSummary {
    fn from_summary(summary: DeploymentSummary, source: SummarySource) -> Self {
        Self {
            metadata: summary.metadata,
            org_id: summary.org_id,
            project_id: summary.project_id,
            source,
        }
    }
}

/// Resolves the deployment summary backing new instances.
///
/// Event-driven passes try the cache first. Everything else (and cache
/// misses) copies a sibling instance of the same sync key, then falls back
/// to the latest persisted summary.
pub struct SummaryResolver<'a> {
    cache: &'a SummaryCache,
    store: &'a dyn DeploymentSummaryStore,
}

impl<'a> SummaryResolver<'a> {
    pub fn new(cache: &'a SummaryCache, store: &'a dyn DeploymentSummaryStore) -> Self {
        Self { cache, store }
    }

    pub async fn resolve(
        &self,
        mapping: &InfrastructureMapping,
        sync_key: &str,
        siblings: &[InstanceRecord],
        event_driven: bool,
    ) -> Result<ResolvedSummary> {
        if event_driven
            && let Some(summary) = self.cache.get(&SummaryCacheKey::new(mapping, sync_key))
        {
            return Ok(ResolvedSummary::from_summary(summary, SummarySource::Cache));
        }

        if let Some(sibling) = siblings
            .iter()
            .max_by_key(|record| record.metadata.deployed_at)
        {
            debug!(sync_key, instance_key = %sibling.instance_key, "Backfilling summary from sibling instance");
            return Ok(ResolvedSummary {
                metadata: sibling.metadata.clone(),
                org_id: sibling.org_id.clone(),
                project_id: sibling.project_id.clone(),
                source: SummarySource::Sibling,
            });
        }

        match self
            .store
            .latest_for_sync_key(&mapping.account_id, &mapping.id, sync_key)
            .await?
        {
            Some(summary) => Ok(ResolvedSummary::from_summary(summary, SummarySource::Store)),
            None => Err(SyncError::NoDeploymentSummaryFound {
                sync_key: sync_key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::DeploymentInfo;
    use serde_json::json;

    fn key(sync_key: &str) -> SummaryCacheKey {
        SummaryCacheKey {
            account_id: "acc".to_string(),
            infrastructure_mapping_id: "im-1".to_string(),
            instance_sync_key: sync_key.to_string(),
        }
    }

    fn summary(sync_key: &str, now: DateTime<Utc>) -> DeploymentSummary {
        DeploymentSummary {
            id: format!("ds-{}", sync_key),
            account_id: "acc".to_string(),
            org_id: None,
            project_id: None,
            instance_sync_key: sync_key.to_string(),
            infrastructure_mapping_id: "im-1".to_string(),
            deployment_info: DeploymentInfo {
                deployment_type: "Kubernetes".to_string(),
                details: json!({}),
            },
            metadata: DeploymentMetadata {
                deployed_by_id: "u1".to_string(),
                deployed_by_name: "User".to_string(),
                pipeline_execution_id: "exec-1".to_string(),
                pipeline_execution_name: "deploy".to_string(),
                stage_status: None,
                rollback_status: None,
                artifact: None,
                deployed_at: now,
            },
            server_instances: Vec::new(),
            created_at: now,
        }
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = SummaryCache::new(Duration::from_secs(600), 10, clock.clone());
        cache.put(summary("web", clock.now()));
        assert!(cache.get(&key("web")).is_some());

        clock.advance(chrono::Duration::minutes(10));
        assert!(cache.get(&key("web")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_evicts_oldest_at_capacity() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = SummaryCache::new(Duration::from_secs(600), 2, clock.clone());
        cache.put(summary("a", clock.now()));
        clock.advance(chrono::Duration::seconds(1));
        cache.put(summary("b", clock.now()));
        clock.advance(chrono::Duration::seconds(1));
        cache.put(summary("c", clock.now()));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_invalidate() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = SummaryCache::new(Duration::from_secs(600), 10, clock.clone());
        cache.put(summary("web", clock.now()));
        cache.invalidate(&key("web"));
        assert!(cache.get(&key("web")).is_none());
    }

    #[test]
    fn test_same_sync_key_on_other_mapping_is_separate() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = SummaryCache::new(Duration::from_secs(600), 10, clock.clone());
        let mut other = summary("web", clock.now());
        other.infrastructure_mapping_id = "im-2".to_string();
        other.metadata.pipeline_execution_id = "exec-2".to_string();
        cache.put(summary("web", clock.now()));
        cache.put(other);

        assert_eq!(cache.len(), 2);
        let own = cache.get(&key("web")).unwrap();
        assert_eq!(own.metadata.pipeline_execution_id, "exec-1");

        cache.invalidate(&key("web"));
        let remaining = SummaryCacheKey {
            infrastructure_mapping_id: "im-2".to_string(),
            ..key("web")
        };
        assert!(cache.get(&remaining).is_some());
    }
}
