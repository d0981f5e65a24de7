//! # Reconciler
//!
//! Drives the managed secret and webhook configuration to the resolved goal.
//!
//! ## Attempt
//!
//! 1. Resolve the [`Goal`](crate::goal::Goal)
//! 2. Feature disabled: delete the secret and the webhook configuration
//! 3. New certificate material: create or update the secret
//! 4. Create or update the webhook configuration from its template
//!
//! ## Retries
//!
//! [`Reconciler::reconcile`] repeats attempts according to the
//! [`RetryPolicy`](crate::config::RetryPolicy): at most 10 attempts, 5s apart,
//! giving up with [`Error::Timeout`] once 15s have passed since the first one.
//! Only the reconciler retries. The resolver and the issuer fail fast.

use crate::cluster::ClusterStore;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::goal::Resolve;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument, Span};

mod secret;
pub(crate) mod webhook;

/// Result of a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// New certificates were written to the secret
    pub rotated: bool,
    /// Attempts made, the successful one included
    pub attempts: u32,
}

/// Applies goals to the cluster
///
/// `reconcile` must not run concurrently on the same reconciler.
pub struct Reconciler {
    config: Arc<ManagerConfig>,
    store: Arc<dyn ClusterStore>,
    resolver: Arc<dyn Resolve>,
    attempts: AtomicU32,
    span: Span,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        config: Arc<ManagerConfig>,
        store: Arc<dyn ClusterStore>,
        resolver: Arc<dyn Resolve>,
    ) -> Self {
        let span = info_span!(
            "reconciler",
            secret = %config.secret_name(),
            webhook = %config.webhook_config_name(),
        );
        Self {
            config,
            store,
            resolver,
            attempts: AtomicU32::new(0),
            span,
        }
    }

    /// Attempts made by the last `reconcile` call
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Run one attempt
    ///
    /// Returns whether new certificate material was written.
    pub async fn reconcile_once(&self) -> Result<bool> {
        self.reconcile_attempt().instrument(self.span.clone()).await
    }

    async fn reconcile_attempt(&self) -> Result<bool> {
        let goal = self.resolver.resolve().await?;

        if !goal.feature_enabled {
            self.cleanup().await?;
            info!("Webhook TLS manager is disabled, cleanup succeeded");
            return Ok(false);
        }

        let rotated = match &goal.certificate_material {
            Some(material) => {
                self.create_or_update_secret(material).await?;
                true
            }
            None => false,
        };

        self.create_or_update_webhook(goal.system_namespace_blocked)
            .await?;
        Ok(rotated)
    }

    /// Run attempts until one succeeds or the retry policy is exhausted
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileOutcome> {
        let policy = self.config.retry;
        let start = Instant::now();
        let mut last_error = None;
        self.attempts.store(0, Ordering::SeqCst);
        info!(parent: &self.span, "Start reconciling webhook");

        for attempt in 1..=policy.attempts {
            let elapsed = start.elapsed();
            if elapsed > policy.timeout {
                error!(parent: &self.span, "Reconcile timed out after {:?}", elapsed);
                return Err(Error::Timeout {
                    elapsed,
                    attempts: attempt - 1,
                    last_error: last_error.map(Box::new),
                });
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.attempts.store(attempt, Ordering::SeqCst);
            match self.reconcile_once().await {
                Ok(rotated) => {
                    info!(parent: &self.span, rotated, "Reconcile succeeded after {} attempts", attempt);
                    return Ok(ReconcileOutcome {
                        rotated,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(parent: &self.span, "Reconcile attempt {}/{} failed: {}", attempt, policy.attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < policy.attempts {
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(policy.interval) => {}
                }
            }
        }

        error!(parent: &self.span, "Reconcile failed after {} attempts", policy.attempts);
        Err(last_error.unwrap_or_else(|| Error::Timeout {
            elapsed: start.elapsed(),
            attempts: 0,
            last_error: None,
        }))
    }
}
