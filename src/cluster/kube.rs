//! `kube`-backed [`ClusterStore`]

use super::{ClusterError, ClusterStore, ObjectKind, Verb};
use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

/// Cluster store talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl std::fmt::Debug for KubeClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterStore").finish_non_exhaustive()
    }
}

impl KubeClusterStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn webhook_configurations(&self) -> Api<MutatingWebhookConfiguration> {
        Api::all(self.client.clone())
    }
}

/// Map a kube error, turning HTTP 404 into [`ClusterError::NotFound`]
fn map_err(verb: Verb, kind: ObjectKind, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => ClusterError::not_found(kind, name),
        err => ClusterError::request(verb, kind, name, err),
    }
}

fn object_name(name: Option<&String>) -> &str {
    name.map_or("", String::as_str)
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        debug!("Getting secret {}/{}", namespace, name);
        self.secrets(namespace)
            .get(name)
            .await
            .map_err(|e| map_err(Verb::Get, ObjectKind::Secret, name, e))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, ClusterError> {
        let name = object_name(secret.metadata.name.as_ref());
        debug!("Creating secret {}/{}", namespace, name);
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| map_err(Verb::Create, ObjectKind::Secret, name, e))
    }

    async fn update_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, ClusterError> {
        let name = object_name(secret.metadata.name.as_ref());
        debug!("Updating secret {}/{}", namespace, name);
        self.secrets(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
            .map_err(|e| map_err(Verb::Update, ObjectKind::Secret, name, e))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        debug!("Deleting secret {}/{}", namespace, name);
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err(Verb::Delete, ObjectKind::Secret, name, e))
    }

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<MutatingWebhookConfiguration, ClusterError> {
        debug!("Getting mutating webhook configuration {}", name);
        self.webhook_configurations()
            .get(name)
            .await
            .map_err(|e| map_err(Verb::Get, ObjectKind::MutatingWebhookConfiguration, name, e))
    }

    async fn create_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ClusterError> {
        let name = object_name(config.metadata.name.as_ref());
        debug!("Creating mutating webhook configuration {}", name);
        self.webhook_configurations()
            .create(&PostParams::default(), config)
            .await
            .map_err(|e| map_err(Verb::Create, ObjectKind::MutatingWebhookConfiguration, name, e))
    }

    async fn update_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ClusterError> {
        let name = object_name(config.metadata.name.as_ref());
        debug!("Updating mutating webhook configuration {}", name);
        self.webhook_configurations()
            .replace(name, &PostParams::default(), config)
            .await
            .map_err(|e| map_err(Verb::Update, ObjectKind::MutatingWebhookConfiguration, name, e))
    }

    async fn delete_webhook_configuration(&self, name: &str) -> Result<(), ClusterError> {
        debug!("Deleting mutating webhook configuration {}", name);
        self.webhook_configurations()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err(Verb::Delete, ObjectKind::MutatingWebhookConfiguration, name, e))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, ClusterError> {
        debug!("Getting configmap {}/{}", namespace, name);
        Api::<ConfigMap>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(|e| map_err(Verb::Get, ObjectKind::ConfigMap, name, e))
    }
}
