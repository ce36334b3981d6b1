// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for instance sync.
//!
//! [`InstanceSyncRuntime`] hosts an [`InstanceSyncService`] inside an existing
//! tokio application: a worker pool for inbound messages and the periodic
//! ledger sweep.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use instance_sync_core::persistence::{PostgresLockManager, PostgresStore};
//! use instance_sync_core::{HandlerRegistry, InstanceSyncConfig, InstanceSyncService, JsonFieldHandler};
//! use instance_sync_runtime::{InstanceSyncRuntime, RuntimeConfig, SyncRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     instance_sync_core::migrations::run(&pool).await?;
//!     let store = Arc::new(PostgresStore::new(pool.clone()));
//!
//!     let service = InstanceSyncService::builder()
//!         .config(InstanceSyncConfig::from_env())
//!         .handlers(HandlerRegistry::new().with(Arc::new(JsonFieldHandler::kubernetes("KubernetesDirect"))))
//!         .instance_store(store.clone())
//!         .summary_store(store.clone())
//!         .mapping_store(store.clone())
//!         .ledger_store(store)
//!         .entity_lookup(entities)
//!         .task_client(task_client)
//!         .lock_manager(Arc::new(PostgresLockManager::new(pool)))
//!         .build()?;
//!
//!     let runtime = InstanceSyncRuntime::builder()
//!         .service(Arc::new(service))
//!         .config(RuntimeConfig::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.dispatcher().submit(SyncRequest::PollV1(response)).await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use instance_sync_core::InstanceSyncService;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RuntimeConfig;
use crate::dispatcher::SyncDispatcher;
use crate::ledger_sweep_worker::LedgerSweepWorker;

/// Builder for creating an [`InstanceSyncRuntime`].
#[derive(Default)]
pub struct InstanceSyncRuntimeBuilder {
    service: Option<Arc<InstanceSyncService>>,
    config: Option<RuntimeConfig>,
}

impl InstanceSyncRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconciliation service (required).
    pub fn service(mut self, service: Arc<InstanceSyncService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Set the runtime configuration.
    ///
    /// Default: [`RuntimeConfig::default()`]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the service is missing or the configuration is invalid.
    pub fn build(self) -> Result<InstanceSyncRuntimeConfig> {
        let service = self
            .service
            .ok_or_else(|| anyhow::anyhow!("service is required"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        Ok(InstanceSyncRuntimeConfig { service, config })
    }
}

/// Configuration for an [`InstanceSyncRuntime`].
pub struct InstanceSyncRuntimeConfig {
    service: Arc<InstanceSyncService>,
    config: RuntimeConfig,
}

impl InstanceSyncRuntimeConfig {
    /// Start the runtime, spawning the dispatcher workers and the ledger sweep.
    pub async fn start(self) -> Result<InstanceSyncRuntime> {
        let dispatcher = SyncDispatcher::start(
            self.service.clone(),
            self.config.worker_count,
            self.config.queue_capacity,
        );

        let sweep_worker = LedgerSweepWorker::new(
            self.service.clone(),
            self.config.sweep_enabled,
            self.config.sweep_interval,
            self.config.sweep_batch_size,
        );
        let sweep_shutdown = sweep_worker.shutdown_handle();
        let sweep_handle = tokio::spawn(async move {
            sweep_worker.run().await;
        });

        info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            sweep_enabled = self.config.sweep_enabled,
            "InstanceSyncRuntime started"
        );

        Ok(InstanceSyncRuntime {
            service: self.service,
            dispatcher,
            sweep_handle,
            sweep_shutdown,
        })
    }
}

/// A running instance sync runtime embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct InstanceSyncRuntime {
    service: Arc<InstanceSyncService>,
    dispatcher: SyncDispatcher,
    sweep_handle: JoinHandle<()>,
    sweep_shutdown: Arc<Notify>,
}

impl InstanceSyncRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> InstanceSyncRuntimeBuilder {
        InstanceSyncRuntimeBuilder::new()
    }

    pub fn service(&self) -> &Arc<InstanceSyncService> {
        &self.service
    }

    /// Queue for inbound deployment events and poll responses.
    pub fn dispatcher(&self) -> &SyncDispatcher {
        &self.dispatcher
    }

    /// Gracefully shut down the runtime.
    ///
    /// Queued requests are drained before the workers exit. Passes in
    /// progress always run to completion.
    pub async fn shutdown(self) {
        info!("InstanceSyncRuntime shutting down...");

        self.sweep_shutdown.notify_one();
        self.dispatcher.shutdown().await;

        if let Err(e) = self.sweep_handle.await {
            error!("Ledger sweep worker task panicked: {}", e);
        }

        info!("InstanceSyncRuntime shutdown complete");
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running() && !self.sweep_handle.is_finished()
    }
}
