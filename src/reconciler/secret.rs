//! Managed secret reconciliation and cleanup

use super::Reconciler;
use crate::config::ManagerConfig;
use crate::constants::{
    CA_CERT_KEY, CA_KEY_KEY, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, SERVER_CERT_KEY,
    SERVER_KEY_KEY,
};
use crate::error::Result;
use crate::goal::CertificateMaterial;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use tracing::info;

/// Write the four certificate fields into `secret`, keeping any other data
fn apply_material(secret: &mut Secret, material: &CertificateMaterial) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    for (key, value) in [
        (CA_CERT_KEY, &material.ca_cert_pem),
        (CA_KEY_KEY, &material.ca_key_pem),
        (SERVER_CERT_KEY, &material.server_cert_pem),
        (SERVER_KEY_KEY, &material.server_key_pem),
    ] {
        data.insert(key.to_string(), ByteString(value.clone()));
    }
}

/// New managed secret holding `material`
fn new_secret(config: &ManagerConfig, material: &CertificateMaterial) -> Secret {
    let mut secret = Secret {
        metadata: ObjectMeta {
            name: Some(config.secret_name()),
            namespace: Some(config.namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_LABEL_KEY.to_string(),
                MANAGED_LABEL_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    apply_material(&mut secret, material);
    secret
}

impl Reconciler {
    /// Store `material` in the managed secret, creating it when missing
    ///
    /// Ownership is not checked here: the resolver only issues material for a
    /// missing or owned secret.
    pub(super) async fn create_or_update_secret(&self, material: &CertificateMaterial) -> Result<()> {
        let namespace = &self.config.namespace;
        let name = self.config.secret_name();

        match self.store.get_secret(namespace, &name).await {
            Ok(mut secret) => {
                apply_material(&mut secret, material);
                self.store.update_secret(namespace, &secret).await?;
                info!("Updated secret {}/{} with new certificates", namespace, name);
            }
            Err(e) if e.is_not_found() => {
                self.store
                    .create_secret(namespace, &new_secret(&self.config, material))
                    .await?;
                info!("Created secret {}/{}", namespace, name);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Delete the managed secret and webhook configuration by name
    ///
    /// Neither object is checked for ownership. A missing object fails the
    /// cleanup like any other delete error.
    pub(super) async fn cleanup(&self) -> Result<()> {
        let namespace = &self.config.namespace;
        let secret_name = self.config.secret_name();
        self.store.delete_secret(namespace, &secret_name).await?;
        info!("Deleted secret {}/{}", namespace, secret_name);

        let webhook_name = self.config.webhook_config_name();
        self.store.delete_webhook_configuration(&webhook_name).await?;
        info!("Deleted mutating webhook configuration {}", webhook_name);
        Ok(())
    }
}
