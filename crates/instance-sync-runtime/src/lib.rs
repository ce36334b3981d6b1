// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance Sync Runtime - hosting for the reconciliation service
//!
//! Embeds an `InstanceSyncService` into a tokio application.
//!
//! ```text
//!  deployment events / poll responses
//!                 │
//!                 ▼
//!        ┌─────────────────┐
//!        │ SyncDispatcher  │  bounded queue
//!        └─────────────────┘
//!          │      │      │
//!          ▼      ▼      ▼
//!       worker  worker  worker ──► InstanceSyncService
//!
//!        LedgerSweepWorker ──────► PerpetualTaskLedger::sweep
//! ```
//!
//! | Variable | Default |
//! |----------|---------|
//! | `INSTANCE_SYNC_RUNTIME_WORKERS` | 4 |
//! | `INSTANCE_SYNC_RUNTIME_QUEUE_CAPACITY` | 256 |
//! | `INSTANCE_SYNC_RUNTIME_SWEEP_ENABLED` | true |
//! | `INSTANCE_SYNC_RUNTIME_SWEEP_INTERVAL_SECS` | 3600 |
//! | `INSTANCE_SYNC_RUNTIME_SWEEP_BATCH_SIZE` | 100 |

/// Runtime configuration loaded from environment variables.
pub mod config;

/// Worker pool for inbound requests.
pub mod dispatcher;

/// Runtime error types.
pub mod error;

/// Periodic ledger sweep.
pub mod ledger_sweep_worker;

/// Runtime builder and lifecycle.
pub mod runtime;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{SyncDispatcher, SyncRequest, SyncResponse};
pub use error::{DispatchError, Error, Result};
pub use ledger_sweep_worker::LedgerSweepWorker;
pub use runtime::InstanceSyncRuntime;
