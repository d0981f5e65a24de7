//! In-memory [`ClusterStore`] for unit tests
//!
//! Records every call per verb and kind and can be told to fail the next
//! calls of a given verb and kind with a request error.

use super::{ClusterError, ClusterStore, ObjectKind, Verb};
use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    secrets: BTreeMap<(String, String), Secret>,
    webhooks: BTreeMap<String, MutatingWebhookConfiguration>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    calls: HashMap<(Verb, ObjectKind), usize>,
    failures: HashMap<(Verb, ObjectKind), usize>,
    revision: u64,
}

impl State {
    /// Count the call and return an injected failure if one is pending
    fn record(&mut self, verb: Verb, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        *self.calls.entry((verb, kind)).or_default() += 1;
        if let Some(remaining) = self.failures.get_mut(&(verb, kind)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterError::request(verb, kind, name, "injected failure"));
            }
        }
        Ok(())
    }

    fn next_revision(&mut self) -> Option<String> {
        self.revision += 1;
        Some(self.revision.to_string())
    }
}

#[derive(Default)]
pub(crate) struct MemoryClusterStore {
    state: Mutex<State>,
}

impl MemoryClusterStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    pub(crate) fn insert_secret(&self, namespace: &str, secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.lock()
            .secrets
            .insert((namespace.to_string(), name), secret);
    }

    pub(crate) fn insert_webhook(&self, config: MutatingWebhookConfiguration) {
        let name = config.metadata.name.clone().unwrap_or_default();
        self.lock().webhooks.insert(name, config);
    }

    pub(crate) fn insert_config_map(&self, namespace: &str, config_map: ConfigMap) {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.lock()
            .config_maps
            .insert((namespace.to_string(), name), config_map);
    }

    pub(crate) fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn webhook(&self, name: &str) -> Option<MutatingWebhookConfiguration> {
        self.lock().webhooks.get(name).cloned()
    }

    /// Number of calls made for a verb and kind
    pub(crate) fn calls(&self, verb: Verb, kind: ObjectKind) -> usize {
        self.lock().calls.get(&(verb, kind)).copied().unwrap_or(0)
    }

    /// Number of create, update and delete calls across all kinds
    pub(crate) fn writes(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|((verb, _), _)| *verb != Verb::Get)
            .map(|(_, count)| count)
            .sum()
    }

    pub(crate) fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Fail the next `times` calls of `verb` on `kind`
    pub(crate) fn fail_next(&self, verb: Verb, kind: ObjectKind, times: usize) {
        self.lock().failures.insert((verb, kind), times);
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        let mut state = self.lock();
        state.record(Verb::Get, ObjectKind::Secret, name)?;
        state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::not_found(ObjectKind::Secret, name))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, ClusterError> {
        let mut state = self.lock();
        let name = secret.metadata.name.clone().unwrap_or_default();
        state.record(Verb::Create, ObjectKind::Secret, &name)?;
        let key = (namespace.to_string(), name.clone());
        if state.secrets.contains_key(&key) {
            return Err(ClusterError::request(
                Verb::Create,
                ObjectKind::Secret,
                name,
                "already exists",
            ));
        }
        let mut stored = secret.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = state.next_revision();
        state.secrets.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, ClusterError> {
        let mut state = self.lock();
        let name = secret.metadata.name.clone().unwrap_or_default();
        state.record(Verb::Update, ObjectKind::Secret, &name)?;
        let key = (namespace.to_string(), name.clone());
        if !state.secrets.contains_key(&key) {
            return Err(ClusterError::not_found(ObjectKind::Secret, name));
        }
        let mut stored = secret.clone();
        stored.metadata.resource_version = state.next_revision();
        state.secrets.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Verb::Delete, ObjectKind::Secret, name)?;
        state
            .secrets
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found(ObjectKind::Secret, name))
    }

    async fn get_webhook_configuration(
        &self,
        name: &str,
    ) -> Result<MutatingWebhookConfiguration, ClusterError> {
        let mut state = self.lock();
        state.record(Verb::Get, ObjectKind::MutatingWebhookConfiguration, name)?;
        state
            .webhooks
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(ObjectKind::MutatingWebhookConfiguration, name))
    }

    async fn create_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ClusterError> {
        let mut state = self.lock();
        let name = config.metadata.name.clone().unwrap_or_default();
        state.record(Verb::Create, ObjectKind::MutatingWebhookConfiguration, &name)?;
        if state.webhooks.contains_key(&name) {
            return Err(ClusterError::request(
                Verb::Create,
                ObjectKind::MutatingWebhookConfiguration,
                name,
                "already exists",
            ));
        }
        let mut stored = config.clone();
        stored.metadata.resource_version = state.next_revision();
        state.webhooks.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_webhook_configuration(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<MutatingWebhookConfiguration, ClusterError> {
        let mut state = self.lock();
        let name = config.metadata.name.clone().unwrap_or_default();
        state.record(Verb::Update, ObjectKind::MutatingWebhookConfiguration, &name)?;
        if !state.webhooks.contains_key(&name) {
            return Err(ClusterError::not_found(
                ObjectKind::MutatingWebhookConfiguration,
                name,
            ));
        }
        let mut stored = config.clone();
        stored.metadata.resource_version = state.next_revision();
        state.webhooks.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_webhook_configuration(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Verb::Delete, ObjectKind::MutatingWebhookConfiguration, name)?;
        state
            .webhooks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found(ObjectKind::MutatingWebhookConfiguration, name))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, ClusterError> {
        let mut state = self.lock();
        state.record(Verb::Get, ObjectKind::ConfigMap, name)?;
        state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::not_found(ObjectKind::ConfigMap, name))
    }
}
