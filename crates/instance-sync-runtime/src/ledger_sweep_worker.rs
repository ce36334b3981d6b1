// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that sweeps the perpetual task ledger.
//!
//! Each sweep walks every ledger entry in pages and:
//! 1. Deletes entries whose collector has not succeeded within the failing window
//! 2. Drops deployment infos unseen for the staleness window
//! 3. Deletes entries left with nothing to watch, releasing their tasks
//!
//! Poll passes already do this for entries whose collector reports. The
//! sweep catches entries whose collector went silent.

use std::sync::Arc;
use std::time::Duration;

use instance_sync_core::InstanceSyncService;
use instance_sync_core::ledger::SweepReport;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;

/// Background worker running periodic ledger sweeps.
pub struct LedgerSweepWorker {
    service: Arc<InstanceSyncService>,
    enabled: bool,
    interval: Duration,
    batch_size: usize,
    shutdown: Arc<Notify>,
}

impl LedgerSweepWorker {
    pub fn new(
        service: Arc<InstanceSyncService>,
        enabled: bool,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            enabled,
            interval,
            batch_size,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Ledger sweep worker disabled");
            return;
        }

        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Ledger sweep worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Ledger sweep worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Ledger sweep failed");
                    }
                }
            }
        }

        info!("Ledger sweep worker stopped");
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let report = self.service.ledger().sweep(self.batch_size).await?;

        if report.deleted_entries > 0 || report.pruned_details > 0 || report.failed_entries > 0 {
            info!(
                scanned = report.scanned,
                pruned_details = report.pruned_details,
                deleted_entries = report.deleted_entries,
                failed_entries = report.failed_entries,
                "Ledger sweep completed"
            );
        } else {
            debug!(scanned = report.scanned, "Ledger sweep completed, nothing to clean");
        }
        Ok(report)
    }
}
