//! Mutating webhook configuration reconciliation
//!
//! The desired configuration comes from the template ConfigMap. Only the CA
//! bundle, the labels and the object name are computed here.
//!
//! Existing configurations are compared on their labels, the CA bundle and the
//! shape of the first webhook entry. Entries after the first are not compared,
//! so a change that only touches a later entry is not detected.

use super::Reconciler;
use crate::cluster::is_managed;
use crate::config::ManagerConfig;
use crate::constants::{
    ADMISSION_ENFORCER_DISABLED_LABEL, ADMISSION_ENFORCER_DISABLED_VALUE, CA_CERT_KEY,
    MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, WEBHOOK_TEMPLATE_KEY,
};
use crate::error::{Error, Result};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Labels of the managed webhook configuration
///
/// Admission enforcement is disabled for the system namespace unless it is
/// blocked.
pub(crate) fn desired_labels(system_namespace_blocked: bool) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(
        MANAGED_LABEL_KEY.to_string(),
        MANAGED_LABEL_VALUE.to_string(),
    )]);
    if !system_namespace_blocked {
        labels.insert(
            ADMISSION_ENFORCER_DISABLED_LABEL.to_string(),
            ADMISSION_ENFORCER_DISABLED_VALUE.to_string(),
        );
    }
    labels
}

/// Build the desired configuration from the template ConfigMap
///
/// The template is a YAML or JSON `MutatingWebhookConfiguration` stored under
/// `mutatingWebhookConfig`. It must define at least one webhook.
pub(crate) fn desired_configuration(
    config: &ManagerConfig,
    template: &ConfigMap,
    ca_bundle: &[u8],
    system_namespace_blocked: bool,
) -> Result<MutatingWebhookConfiguration> {
    let template_name = config.webhook_template_name();
    let raw = template
        .data
        .as_ref()
        .and_then(|data| data.get(WEBHOOK_TEMPLATE_KEY))
        .map(String::as_str)
        .unwrap_or_default();
    if raw.trim().is_empty() {
        return Err(Error::malformed(format!(
            "{WEBHOOK_TEMPLATE_KEY} in configmap {template_name} is empty"
        )));
    }

    let mut desired: MutatingWebhookConfiguration = serde_yaml::from_str(raw).map_err(|e| {
        Error::malformed(format!(
            "{WEBHOOK_TEMPLATE_KEY} in configmap {template_name} is not a mutating webhook configuration: {e}"
        ))
    })?;

    let webhooks = desired.webhooks.get_or_insert_with(Vec::new);
    if webhooks.is_empty() {
        return Err(Error::malformed(format!(
            "{WEBHOOK_TEMPLATE_KEY} in configmap {template_name} defines no webhooks"
        )));
    }
    for webhook in webhooks.iter_mut() {
        webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
    }
    desired.metadata.labels = Some(desired_labels(system_namespace_blocked));
    desired.metadata.name = Some(config.webhook_config_name());
    Ok(desired)
}

/// The fields of a webhook entry that trigger an update when they change
#[derive(Debug, PartialEq)]
pub(crate) struct WebhookEntryShape<'a> {
    name: &'a str,
    service: Option<&'a ServiceReference>,
    namespace_selector: Option<&'a LabelSelector>,
    object_selector: Option<&'a LabelSelector>,
    rules: Option<&'a [RuleWithOperations]>,
}

impl<'a> From<&'a MutatingWebhook> for WebhookEntryShape<'a> {
    fn from(webhook: &'a MutatingWebhook) -> Self {
        Self {
            name: &webhook.name,
            service: webhook.client_config.service.as_ref(),
            namespace_selector: webhook.namespace_selector.as_ref(),
            object_selector: webhook.object_selector.as_ref(),
            rules: webhook.rules.as_deref(),
        }
    }
}

/// Why an existing configuration must be updated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateReason {
    Labels,
    CaBundle,
    FirstEntry,
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            UpdateReason::Labels => "labels differ",
            UpdateReason::CaBundle => "CA bundle differs from the secret",
            UpdateReason::FirstEntry => "first webhook entry differs from the template",
        };
        f.write_str(reason)
    }
}

fn first_entry(config: &MutatingWebhookConfiguration) -> Option<&MutatingWebhook> {
    config.webhooks.as_ref().and_then(|webhooks| webhooks.first())
}

/// Compare an existing configuration against the desired one
pub(crate) fn update_reason(
    current: &MutatingWebhookConfiguration,
    desired: &MutatingWebhookConfiguration,
    ca_bundle: &[u8],
) -> Option<UpdateReason> {
    let no_labels = BTreeMap::new();
    let current_labels = current.metadata.labels.as_ref().unwrap_or(&no_labels);
    let desired_labels = desired.metadata.labels.as_ref().unwrap_or(&no_labels);
    if current_labels != desired_labels {
        debug!(?current_labels, ?desired_labels, "Webhook configuration labels differ");
        return Some(UpdateReason::Labels);
    }

    let Some(current_entry) = first_entry(current) else {
        return Some(UpdateReason::CaBundle);
    };
    let current_bundle = current_entry
        .client_config
        .ca_bundle
        .as_ref()
        .map_or(&[][..], |bundle| bundle.0.as_slice());
    if current_bundle != ca_bundle {
        return Some(UpdateReason::CaBundle);
    }

    let current_shape = WebhookEntryShape::from(current_entry);
    let desired_shape = first_entry(desired).map(WebhookEntryShape::from);
    if desired_shape.as_ref() != Some(&current_shape) {
        debug!(?current_shape, ?desired_shape, "First webhook entry differs");
        return Some(UpdateReason::FirstEntry);
    }
    None
}

impl Reconciler {
    /// Create the webhook configuration or bring an owned one up to date
    pub(super) async fn create_or_update_webhook(&self, system_namespace_blocked: bool) -> Result<()> {
        let namespace = &self.config.namespace;
        let secret_name = self.config.secret_name();
        let webhook_name = self.config.webhook_config_name();

        let secret = self.store.get_secret(namespace, &secret_name).await?;
        let ca_bundle = secret
            .data
            .as_ref()
            .and_then(|data| data.get(CA_CERT_KEY))
            .map(|bundle| bundle.0.clone())
            .unwrap_or_default();
        if ca_bundle.is_empty() {
            warn!("Secret {} has no {}, the CA bundle will be empty", secret_name, CA_CERT_KEY);
        }

        let current = match self.store.get_webhook_configuration(&webhook_name).await {
            Ok(current) => Some(current),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(current) = &current {
            if !is_managed(current.metadata.labels.as_ref()) {
                warn!(
                    "Mutating webhook configuration {} is not managed by this job, leaving it alone",
                    webhook_name
                );
                return Ok(());
            }
        }

        let template = self
            .store
            .get_config_map(namespace, &self.config.webhook_template_name())
            .await?;
        let desired =
            desired_configuration(&self.config, &template, &ca_bundle, system_namespace_blocked)?;

        let Some(current) = current else {
            info!("Creating mutating webhook configuration {}", webhook_name);
            self.store.create_webhook_configuration(&desired).await?;
            return Ok(());
        };

        match update_reason(&current, &desired, &ca_bundle) {
            Some(reason) => {
                info!("Updating mutating webhook configuration {}: {}", webhook_name, reason);
                let mut updated = current;
                updated.metadata.labels = desired.metadata.labels;
                updated.webhooks = desired.webhooks;
                self.store.update_webhook_configuration(&updated).await?;
            }
            None => {
                info!("Mutating webhook configuration {} is up to date", webhook_name);
            }
        }
        Ok(())
    }
}
