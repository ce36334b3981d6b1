// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment-type plugins and their registry.
//!
//! A handler knows how to derive instance and sync keys for one
//! `(deployment type, infrastructure kind)` pair and how to parse what its
//! collector reports. Handlers are registered once at startup and looked up
//! per pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::{DeploymentInfo, InstanceInfo};

/// Per-deployment-type key derivation and payload parsing.
pub trait InstanceSyncHandler: Send + Sync {
    /// Deployment type served by this handler.
    fn deployment_type(&self) -> &str;

    /// Infrastructure kind served by this handler.
    fn infrastructure_kind(&self) -> &str;

    /// Unique key of one running instance within an infrastructure mapping.
    fn instance_key(&self, info: &InstanceInfo) -> Result<String>;

    /// Key of the deployment unit an instance belongs to.
    fn sync_key(&self, info: &InstanceInfo) -> Result<String>;

    /// Key of the deployment unit described by a deployment info.
    ///
    /// Must agree with [`sync_key`](Self::sync_key) for instances of that unit.
    fn deployment_info_sync_key(&self, info: &DeploymentInfo) -> Result<String>;

    /// Decode a raw collector payload into instance infos.
    fn parse_server_payload(&self, payload: &[u8]) -> Result<Vec<InstanceInfo>>;

    /// Whether the batched perpetual-task protocol may be used for this account.
    fn supports_batched_protocol(&self, account_id: &str) -> bool;

    /// Merge a freshly observed payload into a persisted one.
    fn merge_instance(&self, _existing: &InstanceInfo, observed: &InstanceInfo) -> InstanceInfo {
        observed.clone()
    }

    /// Details a collector needs to watch a deployment unit.
    fn release_details(&self, info: &DeploymentInfo) -> Value {
        info.details.clone()
    }
}

/// Static registry from `(deployment type, infrastructure kind)` to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn InstanceSyncHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own type/kind pair, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn InstanceSyncHandler>) -> &mut Self {
        let key = (
            handler.deployment_type().to_string(),
            handler.infrastructure_kind().to_string(),
        );
        self.handlers.insert(key, handler);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, handler: Arc<dyn InstanceSyncHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Resolve the handler for a pair.
    pub fn get(
        &self,
        deployment_type: &str,
        infrastructure_kind: &str,
    ) -> Result<Arc<dyn InstanceSyncHandler>> {
        self.handlers
            .get(&(deployment_type.to_string(), infrastructure_kind.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::HandlerNotFound {
                deployment_type: deployment_type.to_string(),
                infrastructure_kind: infrastructure_kind.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Accounts allowed onto the batched protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BatchedProtocolSupport {
    #[default]
    Disabled,
    AllAccounts,
    Accounts(HashSet<String>),
}

/// Handler deriving keys by joining named JSON fields with `_`.
///
/// Kubernetes-like targets use `["namespace", "releaseName"]` as sync key
/// fields and `["podName", "namespace"]` as instance key fields; host-based
/// targets use `["infrastructureKey"]` and `["host"]`.
#[derive(Debug, Clone)]
pub struct JsonFieldHandler {
    deployment_type: String,
    infrastructure_kind: String,
    sync_key_fields: Vec<String>,
    instance_key_fields: Vec<String>,
    batched: BatchedProtocolSupport,
}

impl JsonFieldHandler {
    pub fn new(
        deployment_type: impl Into<String>,
        infrastructure_kind: impl Into<String>,
        sync_key_fields: &[&str],
        instance_key_fields: &[&str],
    ) -> Self {
        Self {
            deployment_type: deployment_type.into(),
            infrastructure_kind: infrastructure_kind.into(),
            sync_key_fields: sync_key_fields.iter().map(|f| f.to_string()).collect(),
            instance_key_fields: instance_key_fields.iter().map(|f| f.to_string()).collect(),
            batched: BatchedProtocolSupport::Disabled,
        }
    }

    /// Kubernetes pods grouped by namespace and release.
    pub fn kubernetes(infrastructure_kind: impl Into<String>) -> Self {
        Self::new(
            "Kubernetes",
            infrastructure_kind,
            &["namespace", "releaseName"],
            &["podName", "namespace"],
        )
    }

    /// Hosts grouped by infrastructure.
    pub fn ssh(infrastructure_kind: impl Into<String>) -> Self {
        Self::new("Ssh", infrastructure_kind, &["infrastructureKey"], &["host"])
    }

    pub fn with_batched_protocol(mut self, support: BatchedProtocolSupport) -> Self {
        self.batched = support;
        self
    }

    fn join(
        &self,
        fields: &[String],
        lookup: impl Fn(&str) -> Option<String>,
        what: &str,
    ) -> Result<String> {
        let mut parts = Vec::with_capacity(fields.len());
        for field in fields {
            let part = lookup(field).ok_or_else(|| {
                SyncError::InvalidPayload(format!(
                    "{} payload is missing field '{}' needed for the {}",
                    self.deployment_type, field, what
                ))
            })?;
            parts.push(part);
        }
        Ok(parts.join("_"))
    }
}

impl InstanceSyncHandler for JsonFieldHandler {
    fn deployment_type(&self) -> &str {
        &self.deployment_type
    }

    fn infrastructure_kind(&self) -> &str {
        &self.infrastructure_kind
    }

    fn instance_key(&self, info: &InstanceInfo) -> Result<String> {
        self.join(&self.instance_key_fields, |f| info.field(f), "instance key")
    }

    fn sync_key(&self, info: &InstanceInfo) -> Result<String> {
        self.join(&self.sync_key_fields, |f| info.field(f), "sync key")
    }

    fn deployment_info_sync_key(&self, info: &DeploymentInfo) -> Result<String> {
        self.join(&self.sync_key_fields, |f| info.field(f), "sync key")
    }

    fn parse_server_payload(&self, payload: &[u8]) -> Result<Vec<InstanceInfo>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::Array(items) => Ok(items.into_iter().map(InstanceInfo::new).collect()),
            other => Err(SyncError::InvalidPayload(format!(
                "expected a JSON array of instances, got {}",
                json_kind(&other)
            ))),
        }
    }

    fn supports_batched_protocol(&self, account_id: &str) -> bool {
        match &self.batched {
            BatchedProtocolSupport::Disabled => false,
            BatchedProtocolSupport::AllAccounts => true,
            BatchedProtocolSupport::Accounts(accounts) => accounts.contains(account_id),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kubernetes_keys() {
        let handler = JsonFieldHandler::kubernetes("KubernetesDirect");
        let info = InstanceInfo::new(json!({
            "podName": "web-7f9c",
            "namespace": "prod",
            "releaseName": "web",
        }));
        assert_eq!(handler.instance_key(&info).unwrap(), "web-7f9c_prod");
        assert_eq!(handler.sync_key(&info).unwrap(), "prod_web");

        let deployment = DeploymentInfo {
            deployment_type: "Kubernetes".to_string(),
            details: json!({"namespace": "prod", "releaseName": "web"}),
        };
        assert_eq!(handler.deployment_info_sync_key(&deployment).unwrap(), "prod_web");
    }

    #[test]
    fn test_missing_field_is_invalid_payload() {
        let handler = JsonFieldHandler::kubernetes("KubernetesDirect");
        let info = InstanceInfo::new(json!({"podName": "web-1"}));
        let err = handler.sync_key(&info).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn test_parse_server_payload() {
        let handler = JsonFieldHandler::ssh("Pdc");
        let infos = handler
            .parse_server_payload(br#"[{"host": "10.0.0.1"}, {"host": "10.0.0.2"}]"#)
            .unwrap();
        assert_eq!(infos.len(), 2);
        assert!(handler.parse_server_payload(b"").unwrap().is_empty());
        assert!(handler.parse_server_payload(br#"{"host": "x"}"#).is_err());
        assert!(handler.parse_server_payload(b"not json").is_err());
    }

    #[test]
    fn test_batched_protocol_support() {
        let handler = JsonFieldHandler::kubernetes("KubernetesDirect").with_batched_protocol(
            BatchedProtocolSupport::Accounts(["acc-1".to_string()].into_iter().collect()),
        );
        assert!(handler.supports_batched_protocol("acc-1"));
        assert!(!handler.supports_batched_protocol("acc-2"));
        assert!(!JsonFieldHandler::ssh("Pdc").supports_batched_protocol("acc-1"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(JsonFieldHandler::kubernetes("KubernetesDirect")))
            .with(Arc::new(JsonFieldHandler::ssh("Pdc")));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("Kubernetes", "KubernetesDirect").is_ok());
        let err = registry.get("Kubernetes", "Pdc").err().unwrap();
        assert_eq!(err.error_code(), "HANDLER_NOT_FOUND");
    }
}
