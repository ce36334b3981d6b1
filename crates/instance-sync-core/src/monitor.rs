// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-pass metrics.

use std::time::Duration;

use tracing::info;

/// Receives one record per reconciliation pass attempt.
pub trait SyncMonitor: Send + Sync {
    fn record_pass(
        &self,
        account_id: &str,
        is_new_deployment: bool,
        success: bool,
        duration: Duration,
    );
}

/// Emits pass metrics as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl SyncMonitor for TracingMonitor {
    fn record_pass(
        &self,
        account_id: &str,
        is_new_deployment: bool,
        success: bool,
        duration: Duration,
    ) {
        info!(
            target: "instance_sync::metrics",
            account_id,
            is_new_deployment,
            success,
            duration_ms = duration.as_millis() as u64,
            "instance sync pass"
        );
    }
}
