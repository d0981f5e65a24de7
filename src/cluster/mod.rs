//! # Cluster Object Store
//!
//! The interface the goal resolver and the reconciler use to talk to the
//! cluster. Only the verbs the manager needs are exposed:
//!
//! - `Secret`: get / create / update / delete by namespace and name
//! - `MutatingWebhookConfiguration`: get / create / update / delete by name
//! - `ConfigMap`: get by namespace and name (webhook template, read-only)
//!
//! [`KubeClusterStore`] implements the trait with `kube::Api`.

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::constants::{MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE};

pub mod kube;

#[cfg(test)]
pub(crate) mod memory;

pub use self::kube::KubeClusterStore;

/// Kind of object handled by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Secret,
    MutatingWebhookConfiguration,
    ConfigMap,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ObjectKind::Secret => "secret",
            ObjectKind::MutatingWebhookConfiguration => "mutating webhook configuration",
            ObjectKind::ConfigMap => "configmap",
        };
        f.write_str(kind)
    }
}

/// Store operation, used for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Verb::Get => "get",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        };
        f.write_str(verb)
    }
}

/// Object store errors
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist. Drives create-vs-update branching.
    #[error("{kind} {name} not found")]
    NotFound { kind: ObjectKind, name: String },

    /// Any other failure (network, conflict, throttling, authorization)
    #[error("{verb} {kind} {name} failed: {source}")]
    Request {
        verb: Verb,
        kind: ObjectKind,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ClusterError {
    pub fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn request(
        verb: Verb,
        kind: ObjectKind,
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Request {
            verb,
            kind,
            name: name.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// CRUD access to the objects managed by this job
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret)
        -> Result<Secret, ClusterError>;

    /// Replace an existing secret (the object must carry its name)
    async fn update_secret(&self, namespace: &str, secret: &Secret)
        -> Result<Secret, ClusterError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<MutatingWebhookConfiguration, ClusterError>;

    async fn create_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ClusterError>;

    /// Replace an existing webhook configuration (the object must carry its name)
    async fn update_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ClusterError>;

    async fn delete_webhook_configuration(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<ConfigMap, ClusterError>;
}

/// Whether a label set carries the exact ownership label of this manager
#[must_use]
pub fn is_managed(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|labels| labels.get(MANAGED_LABEL_KEY))
        .is_some_and(|value| value == MANAGED_LABEL_VALUE)
}
