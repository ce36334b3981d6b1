// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for instance-sync-core.
//!
//! Errors are scoped to a single reconciliation pass (one infrastructure
//! mapping, or one sync key inside it). Nothing here is meant to abort a
//! whole batch of mappings.

use thiserror::Error;

/// Result type using [`SyncError`].
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while reconciling instance inventories.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The distributed lock for an infrastructure mapping could not be acquired in time.
    #[error("Timed out acquiring lock '{key}'")]
    LockTimeout {
        /// The lock key that was contended.
        key: String,
    },

    /// The referenced infrastructure mapping does not exist.
    #[error("Infrastructure mapping '{0}' not found")]
    InfraMappingNotFound(String),

    /// The owning service or environment of a mapping no longer exists.
    #[error("{entity} not found for infrastructure mapping '{infrastructure_mapping_id}'")]
    ServiceOrEnvNotFound {
        /// The infrastructure mapping being reconciled.
        infrastructure_mapping_id: String,
        /// Which entity is missing ("Service" or "Environment").
        entity: &'static str,
    },

    /// No deployment summary could be resolved for newly observed instances.
    #[error("No deployment summary found for sync key '{sync_key}'")]
    NoDeploymentSummaryFound {
        /// The sync key whose additions could not be materialized.
        sync_key: String,
    },

    /// The connector bound to a batched (V2) task could not be found.
    #[error("Connector '{connector_ref}' not found in account '{account_id}'")]
    ConnectorNotFound {
        /// Account owning the connector.
        account_id: String,
        /// Connector reference that failed to resolve.
        connector_ref: String,
    },

    /// No handler is registered for the deployment type / infrastructure kind pair.
    #[error("No instance sync handler for deployment type '{deployment_type}' and infrastructure kind '{infrastructure_kind}'")]
    HandlerNotFound {
        /// Deployment type (e.g. "Kubernetes").
        deployment_type: String,
        /// Infrastructure kind (e.g. "KubernetesDirect").
        infrastructure_kind: String,
    },

    /// A handler could not interpret an instance payload.
    #[error("Invalid instance payload: {0}")]
    InvalidPayload(String),

    /// A collaborator store reported a failure.
    #[error("Store error during '{operation}': {details}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration or builder input.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Get the stable error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::InfraMappingNotFound(_) => "INFRA_MAPPING_NOT_FOUND",
            Self::ServiceOrEnvNotFound { .. } => "SERVICE_OR_ENV_NOT_FOUND",
            Self::NoDeploymentSummaryFound { .. } => "NO_DEPLOYMENT_SUMMARY_FOUND",
            Self::ConnectorNotFound { .. } => "CONNECTOR_NOT_FOUND",
            Self::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::Store { .. } => "STORE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether an event-driven pass failing with this error should be retried.
    ///
    /// Missing entities, malformed payloads and wiring problems are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InfraMappingNotFound(_)
                | Self::ServiceOrEnvNotFound { .. }
                | Self::ConnectorNotFound { .. }
                | Self::HandlerNotFound { .. }
                | Self::InvalidPayload(_)
                | Self::Json(_)
                | Self::Config(_)
        )
    }

    /// Shorthand for building a [`SyncError::Store`].
    pub fn store(operation: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            details: details.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                SyncError::LockTimeout {
                    key: "INSTANCE_SYNC:im-1".to_string(),
                },
                "LOCK_TIMEOUT",
            ),
            (
                SyncError::InfraMappingNotFound("im-1".to_string()),
                "INFRA_MAPPING_NOT_FOUND",
            ),
            (
                SyncError::NoDeploymentSummaryFound {
                    sync_key: "web".to_string(),
                },
                "NO_DEPLOYMENT_SUMMARY_FOUND",
            ),
            (
                SyncError::ConnectorNotFound {
                    account_id: "acc".to_string(),
                    connector_ref: "conn".to_string(),
                },
                "CONNECTOR_NOT_FOUND",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "wrong code for {:?}", error);
        }
    }

    #[test]
    fn test_retry_policy() {
        assert!(
            SyncError::LockTimeout {
                key: "k".to_string()
            }
            .is_retryable()
        );
        assert!(SyncError::store("replace", "connection reset").is_retryable());
        assert!(!SyncError::InfraMappingNotFound("im".to_string()).is_retryable());
        assert!(
            !SyncError::ConnectorNotFound {
                account_id: "acc".to_string(),
                connector_ref: "conn".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display() {
        let err = SyncError::ServiceOrEnvNotFound {
            infrastructure_mapping_id: "im-1".to_string(),
            entity: "Service",
        };
        assert_eq!(
            err.to_string(),
            "Service not found for infrastructure mapping 'im-1'"
        );
    }
}
