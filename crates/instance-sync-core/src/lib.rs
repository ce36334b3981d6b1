// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance Sync Core - deployed-workload inventory reconciliation
//!
//! This crate keeps a persisted inventory of running workload instances
//! (pods, hosts, containers) consistent with what collectors ("perpetual
//! tasks") report and with discrete deployment events.
//!
//! # Architecture
//!
//! ```text
//!   NewDeploymentEvent      PollResponseV1 / PollResponseV2
//!           │                          │
//!           ▼                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │              InstanceSyncService                     │
//! │  lock ─► grouper ─► diff ─► apply ─► ledger          │
//! └─────────────────────────────────────────────────────┘
//!     │            │             │              │
//!     ▼            ▼             ▼              ▼
//! LockManager  HandlerRegistry  InstanceStore  PerpetualTaskLedger
//!                                                   │
//!                                                   ▼
//!                                          PerpetualTaskClient
//! ```
//!
//! # Passes
//!
//! One pass reconciles one infrastructure mapping under its lock
//! (`INSTANCE_SYNC:<mapping id>`). Both sides are bucketed by sync key and
//! diffed per key:
//!
//! | Persisted | Observed | Result |
//! |-----------|----------|--------|
//! | yes | no | delete |
//! | no | yes | add (with a resolved deployment summary) |
//! | yes | yes | update (handler merge) |
//!
//! A sync key missing entirely from a complete poll payload deletes all of
//! its instances. Deployment events and partial payloads never do.
//!
//! # Ledger
//!
//! Each mapping has at most one ledger entry listing the deployment units
//! being watched and the collector protocol in use (legacy V1 or batched
//! V2). Units unseen for 14 days are dropped; entries whose collector has
//! not succeeded for 7 days are deleted.

/// Injectable wall clock.
pub mod clock;

/// Tunables loaded from environment variables.
pub mod config;

/// Reconciliation coordinator and its builder.
pub mod coordinator;

/// Per-sync-key diff engine.
pub mod diff;

/// Error taxonomy with stable codes and retry policy.
pub mod error;

/// Sync key bucketing.
pub mod grouper;

/// Deployment-type handlers and registry.
pub mod handler;

/// Perpetual task ledger bookkeeping and protocol migration.
pub mod ledger;

/// Lease-based locking per infrastructure mapping.
pub mod lock;

/// Embedded PostgreSQL migrations.
pub mod migrations;

/// Records and inbound message shapes.
pub mod model;

/// Per-pass metrics.
pub mod monitor;

/// Collector task client.
pub mod perpetual_task;

/// Storage traits and backends.
pub mod persistence;

/// Deployment summary cache and resolution.
pub mod summary_cache;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::InstanceSyncConfig;
pub use coordinator::{BatchReport, EntryFailure, InstanceSyncService, TaskDetails};
pub use error::{Result, SyncError};
pub use handler::{HandlerRegistry, InstanceSyncHandler, JsonFieldHandler};
pub use ledger::PerpetualTaskLedger;
pub use model::*;
pub use monitor::{SyncMonitor, TracingMonitor};
pub use perpetual_task::{MemoryTaskClient, PerpetualTaskClient};
pub use summary_cache::SummaryCacheKey;
