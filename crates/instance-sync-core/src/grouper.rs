// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Buckets persisted records and observed instance infos by sync key.

use std::collections::BTreeMap;

use tracing::warn;

use crate::handler::InstanceSyncHandler;
use crate::model::{InstanceInfo, InstanceRecord};

/// Items bucketed by sync key. Missing keys read as empty.
#[derive(Debug, Clone)]
pub struct SyncKeyGroups<T> {
    groups: BTreeMap<String, Vec<T>>,
}

impl<T> Default for SyncKeyGroups<T> {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }
}

impl<T> SyncKeyGroups<T> {
    /// Items under `sync_key`, empty when the key is absent.
    pub fn get(&self, sync_key: &str) -> &[T] {
        self.groups.get(sync_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, sync_key: &str) -> bool {
        self.groups.contains_key(sync_key)
    }

    /// Sync keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Number of distinct sync keys.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of items across all keys.
    pub fn item_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    fn push(&mut self, sync_key: String, item: T) {
        self.groups.entry(sync_key).or_default().push(item);
    }
}

/// Both sides of a pass, bucketed by sync key.
#[derive(Debug, Clone, Default)]
pub struct GroupedSnapshot {
    pub db: SyncKeyGroups<InstanceRecord>,
    pub server: SyncKeyGroups<InstanceInfo>,
}

impl GroupedSnapshot {
    /// Union of sync keys on both sides, ascending.
    pub fn all_sync_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .db
            .keys()
            .chain(self.server.keys())
            .map(str::to_string)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Groups records and infos with a handler-derived sync key.
pub struct SyncKeyGrouper;

impl SyncKeyGrouper {
    /// Bucket both sides. Items whose sync key cannot be derived are logged and left out.
    pub fn group(
        handler: &dyn InstanceSyncHandler,
        records: Vec<InstanceRecord>,
        infos: Vec<InstanceInfo>,
    ) -> GroupedSnapshot {
        GroupedSnapshot {
            db: Self::group_records(handler, records),
            server: Self::group_infos(handler, infos),
        }
    }

    pub fn group_records(
        handler: &dyn InstanceSyncHandler,
        records: Vec<InstanceRecord>,
    ) -> SyncKeyGroups<InstanceRecord> {
        let mut groups = SyncKeyGroups::default();
        for record in records {
            match handler.sync_key(&record.instance_info) {
                Ok(key) => groups.push(key, record),
                Err(e) => warn!(
                    instance_key = %record.instance_key,
                    infrastructure_mapping_id = %record.infrastructure_mapping_id,
                    error = %e,
                    "Skipping persisted instance without a sync key"
                ),
            }
        }
        groups
    }

    pub fn group_infos(
        handler: &dyn InstanceSyncHandler,
        infos: Vec<InstanceInfo>,
    ) -> SyncKeyGroups<InstanceInfo> {
        let mut groups = SyncKeyGroups::default();
        for info in infos {
            match handler.sync_key(&info) {
                Ok(key) => groups.push(key, info),
                Err(e) => warn!(error = %e, "Skipping observed instance without a sync key"),
            }
        }
        groups
    }
}
