// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Property tests for per-sync-key diffing over arbitrary inventories.

mod common;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use proptest::prelude::*;

use instance_sync_core::diff::{DiffEngine, PassOrigin};
use instance_sync_core::grouper::SyncKeyGrouper;
use instance_sync_core::persistence::{DeploymentSummaryStore, MemoryStore};
use instance_sync_core::summary_cache::{SummaryCache, SummaryResolver};
use instance_sync_core::{
    InfrastructureMapping, InstanceInfo, InstanceRecord, JsonFieldHandler, ManualClock,
    ReconciliationResult,
};

const RELEASES: [&str; 4] = ["web", "api", "cache", "batch"];

/// Per release: pod ordinals persisted, pod ordinals observed.
type Inventory = BTreeMap<&'static str, (BTreeSet<u8>, BTreeSet<u8>)>;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_pods() -> impl Strategy<Value = BTreeSet<u8>> {
    prop::collection::btree_set(0u8..8, 0..6)
}

fn arb_inventory() -> impl Strategy<Value = Inventory> {
    prop::collection::btree_map(
        prop::sample::select(RELEASES.to_vec()),
        (arb_pods(), arb_pods()),
        0..=RELEASES.len(),
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn pod_name(release: &str, ordinal: u8) -> String {
    format!("{}-{}", release, ordinal)
}

fn sides(
    mapping: &InfrastructureMapping,
    inventory: &Inventory,
) -> (Vec<InstanceRecord>, Vec<InstanceInfo>) {
    let now = start_time();
    let mut db = Vec::new();
    let mut server = Vec::new();
    for (release, (persisted, observed)) in inventory {
        for ordinal in persisted {
            let name = pod_name(release, *ordinal);
            db.push(InstanceRecord::new(
                mapping,
                "Kubernetes",
                format!("{}_ns", name),
                pod(&name, release),
                metadata("exec-db", now),
                now,
            ));
        }
        for ordinal in observed {
            server.push(pod(&pod_name(release, *ordinal), release));
        }
    }
    (db, server)
}

fn instance_keys<T>(items: &[T], key: impl Fn(&T) -> String) -> HashSet<String> {
    items.iter().map(key).collect()
}

/// Plan and materialize one pass with a stored summary for every release.
fn reconcile(
    db: Vec<InstanceRecord>,
    server: Vec<InstanceInfo>,
    origin: PassOrigin<'_>,
) -> ReconciliationResult {
    let mapping = mapping("im-1");
    let handler = JsonFieldHandler::kubernetes(KIND);
    let clock = Arc::new(ManualClock::new(start_time()));
    let cache = SummaryCache::new(Duration::from_secs(600), 16, clock);
    let store = MemoryStore::new();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        for release in RELEASES {
            store
                .save_summary(&summary(&mapping, release, "exec-stored", &[], start_time()))
                .await
                .unwrap();
        }
        let snapshot = SyncKeyGrouper::group(&handler, db, server);
        let plans = DiffEngine::plan(&handler, &snapshot, origin);
        let resolver = SummaryResolver::new(&cache, &store);
        let outcome =
            DiffEngine::materialize(&handler, &mapping, plans, origin, &resolver, start_time())
                .await;
        assert!(outcome.failures.is_empty());
        outcome.result
    })
}

/// Inventory after applying `result` to `db`: delete, then add, then update.
fn apply(db: Vec<InstanceRecord>, result: &ReconciliationResult) -> Vec<InstanceRecord> {
    let (_, updated, deleted) = result.instance_keys();
    let mut next: Vec<InstanceRecord> = db
        .into_iter()
        .filter(|r| !deleted.contains(&r.instance_key) && !updated.contains(&r.instance_key))
        .collect();
    next.extend(result.to_add.iter().cloned());
    next.extend(result.to_update.iter().cloned());
    next
}

const COMPLETE_POLL: PassOrigin<'static> = PassOrigin::Poll { partial: false };

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// No instance key lands in more than one list.
    #[test]
    fn mutation_lists_are_disjoint(inventory in arb_inventory(), partial in any::<bool>()) {
        let (db, server) = sides(&mapping("im-1"), &inventory);
        let result = reconcile(db, server, PassOrigin::Poll { partial });
        let (added, updated, deleted) = result.instance_keys();

        prop_assert!(added.is_disjoint(&updated));
        prop_assert!(added.is_disjoint(&deleted));
        prop_assert!(updated.is_disjoint(&deleted));
        prop_assert_eq!(added.len(), result.to_add.len());
    }

    /// A complete poll leaves exactly the observed instances persisted.
    #[test]
    fn complete_poll_converges_to_observation(inventory in arb_inventory()) {
        let (db, server) = sides(&mapping("im-1"), &inventory);
        let observed = instance_keys(&server, |p| {
            format!("{}_ns", p.as_value()["podName"].as_str().unwrap_or_default())
        });

        let result = reconcile(db.clone(), server, COMPLETE_POLL);
        let next = apply(db, &result);

        prop_assert_eq!(next.len(), observed.len());
        prop_assert_eq!(instance_keys(&next, |r| r.instance_key.clone()), observed);
    }

    /// Re-running a complete poll on its own outcome adds and deletes nothing.
    #[test]
    fn complete_poll_is_idempotent(inventory in arb_inventory()) {
        let (db, server) = sides(&mapping("im-1"), &inventory);
        let first = reconcile(db.clone(), server.clone(), COMPLETE_POLL);
        let next = apply(db, &first);

        let second = reconcile(next.clone(), server, COMPLETE_POLL);
        prop_assert!(second.to_add.is_empty());
        prop_assert!(second.to_delete.is_empty());
        prop_assert_eq!(second.to_update.len(), next.len());
    }

    /// Partial polls only delete inside releases that were observed.
    #[test]
    fn partial_poll_keeps_vanished_releases(inventory in arb_inventory()) {
        let (db, server) = sides(&mapping("im-1"), &inventory);
        let result = reconcile(db, server, PassOrigin::Poll { partial: true });

        for record in &result.to_delete {
            let release = record.instance_info.as_value()["releaseName"]
                .as_str()
                .unwrap_or_default();
            let observed = inventory.get(release).map(|(_, o)| !o.is_empty()).unwrap_or(false);
            prop_assert!(observed, "deleted {} from vanished release {}", record.instance_key, release);
        }
    }
}
