//! # Goal Resolution
//!
//! Computes the desired state for one reconcile attempt.
//!
//! The resolver reads the managed secret and decides whether the serving
//! certificate must be rotated:
//!
//! - secret not found: rotate
//! - secret not labelled `app.kubernetes.io/managed-by=aks`: never rotate
//! - owned secret: rotate when `serverCert.pem` expires within one month
//!
//! When rotating it issues a new CA and serving certificate. Resolution only
//! reads from the cluster, it never writes.

use crate::certificates::{parse_expiry, rotation_due, CertificateIssuer};
use crate::cluster::{is_managed, ClusterStore};
use crate::config::ManagerConfig;
use crate::constants::{CLOCK_SKEW, SERVER_CERT_KEY};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument, Span};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// CA and serving certificate with their keys, all PEM encoded
///
/// Always complete: a resolver never returns partial material.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CertificateMaterial {
    pub ca_cert_pem: Vec<u8>,
    pub ca_key_pem: Vec<u8>,
    pub server_cert_pem: Vec<u8>,
    pub server_key_pem: Vec<u8>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("ca_cert_pem", &String::from_utf8_lossy(&self.ca_cert_pem))
            .field("server_cert_pem", &String::from_utf8_lossy(&self.server_cert_pem))
            .finish_non_exhaustive()
    }
}

/// Desired state for one reconcile attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goal {
    /// New certificates to store, present only when rotating
    pub certificate_material: Option<CertificateMaterial>,
    pub feature_enabled: bool,
    pub system_namespace_blocked: bool,
}

/// Produces a [`Goal`]
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self) -> Result<Goal>;
}

/// Resolves the goal from the managed secret
pub struct GoalResolver {
    config: Arc<ManagerConfig>,
    store: Arc<dyn ClusterStore>,
    issuer: CertificateIssuer,
    span: Span,
}

impl std::fmt::Debug for GoalResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalResolver")
            .field("config", &self.config)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl GoalResolver {
    pub fn new(
        config: Arc<ManagerConfig>,
        store: Arc<dyn ClusterStore>,
        issuer: CertificateIssuer,
    ) -> Self {
        let span = info_span!(
            "goal_resolver",
            feature_enabled = config.feature_enabled,
            system_namespace_blocked = config.system_namespace_blocked,
        );
        Self {
            config,
            store,
            issuer,
            span,
        }
    }

    /// Whether the stored serving certificate must be replaced
    pub async fn should_rotate(&self) -> Result<bool> {
        self.should_rotate_at(Utc::now())
            .instrument(self.span.clone())
            .await
    }

    async fn should_rotate_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let name = self.config.secret_name();
        let secret = match self.store.get_secret(&self.config.namespace, &name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                info!("Secret {} does not exist, issuing certificates", name);
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        if !is_managed(secret.metadata.labels.as_ref()) {
            warn!("Secret {} is not managed by this job, leaving it alone", name);
            return Ok(false);
        }

        let pem = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SERVER_CERT_KEY))
            .map_or(&[][..], |bytes| bytes.0.as_slice());
        let expiry = parse_expiry(pem).map_err(|e| {
            Error::malformed(format!("{SERVER_CERT_KEY} in secret {name}: {e}"))
        })?;
        if expiry.trailing_bytes > 0 {
            warn!(
                "{} in secret {} has {} unexpected bytes after the certificate",
                SERVER_CERT_KEY, name, expiry.trailing_bytes
            );
        }

        let rotate = rotation_due(expiry.not_after, now);
        info!(
            not_after = %expiry.not_after,
            rotate,
            "Checked expiry of the serving certificate in secret {}", name
        );
        Ok(rotate)
    }

    /// Issue a new CA and a serving certificate signed by it
    pub async fn generate_certificates(&self) -> Result<CertificateMaterial> {
        let not_before = Utc::now() - TimeDelta::from_std(CLOCK_SKEW).unwrap_or_default();
        let ca_cn = self.config.ca_common_name();
        let server_cn = self.config.server_common_name();

        async {
            let ca = self
                .issuer
                .issue_self_signed_ca(&ca_cn, not_before, self.config.ca_validity_years)
                .await?;
            let server = self
                .issuer
                .issue_leaf_certificate(
                    &server_cn,
                    &ca_cn,
                    not_before,
                    self.config.server_validity_years,
                    &ca.certificate,
                    &ca.private_key,
                )
                .await?;
            info!("Issued CA {} and serving certificate {}", ca_cn, server_cn);

            Ok(CertificateMaterial {
                ca_cert_pem: ca.certificate_pem.clone(),
                ca_key_pem: ca.private_key_pem.to_vec(),
                server_cert_pem: server.certificate_pem.clone(),
                server_key_pem: server.private_key_pem.to_vec(),
            })
        }
        .instrument(self.span.clone())
        .await
    }
}

#[async_trait]
impl Resolve for GoalResolver {
    async fn resolve(&self) -> Result<Goal> {
        let certificate_material = if self.should_rotate().await? {
            Some(self.generate_certificates().await?)
        } else {
            info!(parent: &self.span, "No certificate rotation needed");
            None
        };
        Ok(Goal {
            certificate_material,
            feature_enabled: self.config.feature_enabled,
            system_namespace_blocked: self.config.system_namespace_blocked,
        })
    }
}
