// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for instance-sync-runtime.

use instance_sync_core::SyncError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A reconciliation pass failed.
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Request could not be handed to a worker.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Why a request was not queued.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Queue is at capacity.
    #[error("dispatch queue is full")]
    QueueFull,
    /// Dispatcher has stopped accepting requests.
    #[error("dispatcher is shut down")]
    ShutDown,
}

/// Result type using runtime Error.
pub type Result<T> = std::result::Result<T, Error>;
