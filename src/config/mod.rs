//! # Configuration
//!
//! Command-line flags (with environment variable fallbacks) and the immutable
//! [`ManagerConfig`] derived from them.
//!
//! Flags are read once at startup. The resulting configuration is shared by
//! `Arc` with the goal resolver and the reconciler and never changes for the
//! lifetime of the process.

use crate::constants::{
    DEFAULT_CA_VALIDITY_YEARS, DEFAULT_KEY_POOL_SIZE, DEFAULT_KEY_POOL_WORKERS,
    DEFAULT_METRICS_ADDR, DEFAULT_NAMESPACE, DEFAULT_OBJECT_NAME, DEFAULT_SERVER_VALIDITY_YEARS,
    RECONCILE_RETRY_COUNT, RECONCILE_RETRY_INTERVAL, RECONCILE_RETRY_TIMEOUT,
};
use clap::{ArgAction, Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

/// Webhook TLS manager job
#[derive(Debug, Clone, Parser)]
#[command(name = "webhook-tls-manager")]
#[command(
    about = "Rotates admission webhook TLS certificates and reconciles the webhook configuration",
    long_about = None
)]
pub struct Args {
    /// If set to false, the job removes the managed secret and webhook configuration instead
    #[arg(long, env = "WEBHOOK_TLS_MANAGER_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub webhook_tls_manager_enabled: bool,

    /// If set to false, objects in kube-system are exempted from the webhook
    #[arg(long, env = "KUBE_SYSTEM_NAMESPACE_BLOCKED", default_value_t = false, action = ArgAction::Set)]
    pub kube_system_namespace_blocked: bool,

    /// Namespace of the managed secret and the webhook template ConfigMap
    #[arg(long, env = "POD_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Name stem of every managed object
    #[arg(long, env = "MANAGED_OBJECT_NAME", default_value = "")]
    pub webhook_tls_manager_managed_object_name: String,

    /// Validity of the CA certificate in years (0 = default)
    #[arg(long, env = "CA_VALIDITY_YEARS", default_value_t = 0)]
    pub ca_validity_years: u32,

    /// Validity of the server certificate in years (0 = default)
    #[arg(long, env = "SERVER_VALIDITY_YEARS", default_value_t = 0)]
    pub server_validity_years: u32,

    /// Log level used when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Listen address of the metrics and health server
    #[arg(long, env = "METRICS_ADDR", default_value = DEFAULT_METRICS_ADDR)]
    pub metrics_addr: SocketAddr,

    /// Number of pre-generated keys kept in the key pool
    #[arg(long, env = "KEY_POOL_SIZE", default_value_t = DEFAULT_KEY_POOL_SIZE)]
    pub key_pool_size: usize,

    /// Number of background key generation workers
    #[arg(long, env = "KEY_POOL_WORKERS", default_value_t = DEFAULT_KEY_POOL_WORKERS)]
    pub key_pool_workers: i64,

    /// Seconds to wait for the key pool to fill before resolving (0 = don't wait)
    #[arg(long, env = "KEY_POOL_WARMUP_SECS", default_value_t = 0)]
    pub key_pool_warmup_secs: u64,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    /// Build the immutable manager configuration from the parsed flags
    ///
    /// Empty names and zero validity values fall back to the defaults.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        if !self.webhook_tls_manager_managed_object_name.is_empty() {
            config
                .object_name
                .clone_from(&self.webhook_tls_manager_managed_object_name);
        }
        if !self.namespace.is_empty() {
            config.namespace.clone_from(&self.namespace);
        }
        if self.ca_validity_years != 0 {
            config.ca_validity_years = self.ca_validity_years;
        }
        if self.server_validity_years != 0 {
            config.server_validity_years = self.server_validity_years;
        }
        config.feature_enabled = self.webhook_tls_manager_enabled;
        config.system_namespace_blocked = self.kube_system_namespace_blocked;
        config
    }

    /// Optional key pool warmup duration
    #[must_use]
    pub fn key_pool_warmup(&self) -> Option<Duration> {
        (self.key_pool_warmup_secs > 0).then(|| Duration::from_secs(self.key_pool_warmup_secs))
    }
}

/// Manager configuration
///
/// Holds the object naming, certificate lifetimes, feature flags and the
/// reconcile retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Name stem of every managed object
    pub object_name: String,
    /// Namespace of the managed secret and the webhook template
    pub namespace: String,
    /// CA certificate lifetime in years
    pub ca_validity_years: u32,
    /// Server certificate lifetime in years
    pub server_validity_years: u32,
    /// Whether the webhook capability is enabled (false = cleanup)
    pub feature_enabled: bool,
    /// Whether kube-system is subject to the webhook
    pub system_namespace_blocked: bool,
    /// Reconcile retry envelope
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            object_name: DEFAULT_OBJECT_NAME.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            ca_validity_years: DEFAULT_CA_VALIDITY_YEARS,
            server_validity_years: DEFAULT_SERVER_VALIDITY_YEARS,
            feature_enabled: true,
            system_namespace_blocked: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Name of the secret holding the CA and server certificates
    #[must_use]
    pub fn secret_name(&self) -> String {
        format!("{}-tls-certs", self.object_name)
    }

    /// Name of the managed MutatingWebhookConfiguration
    #[must_use]
    pub fn webhook_config_name(&self) -> String {
        format!("{}-webhook-config", self.object_name)
    }

    /// Name of the ConfigMap holding the desired webhook configuration
    #[must_use]
    pub fn webhook_template_name(&self) -> String {
        format!("{}-webhook-config", self.object_name)
    }

    /// Name of the webhook service
    #[must_use]
    pub fn service_name(&self) -> String {
        format!("{}-webhook", self.object_name)
    }

    #[must_use]
    pub fn ca_common_name(&self) -> String {
        format!("{}_webhook_ca", self.object_name)
    }

    /// DNS name of the webhook service, used as the server certificate subject
    #[must_use]
    pub fn server_common_name(&self) -> String {
        format!("{}.{}.svc", self.service_name(), self.namespace)
    }

    /// Prometheus metric prefix (`-` is not valid in metric names)
    #[must_use]
    pub fn metrics_prefix(&self) -> String {
        format!("{}_metrics", self.object_name).replace(['-', '.'], "_")
    }
}

/// Retry envelope of `Reconciler::reconcile`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub attempts: u32,
    /// Sleep between attempts
    pub interval: Duration,
    /// Wall-clock budget measured from the first attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RECONCILE_RETRY_COUNT,
            interval: RECONCILE_RETRY_INTERVAL,
            timeout: RECONCILE_RETRY_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["webhook-tls-manager"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.object_name, "webhook-tls-manager");
        assert_eq!(config.namespace, "kube-system");
        assert_eq!(config.ca_validity_years, 30);
        assert_eq!(config.server_validity_years, 2);
        assert!(config.feature_enabled);
        assert!(!config.system_namespace_blocked);
    }

    #[test]
    fn test_derived_names() {
        let config = ManagerConfig::default();
        assert_eq!(config.secret_name(), "webhook-tls-manager-tls-certs");
        assert_eq!(config.webhook_config_name(), "webhook-tls-manager-webhook-config");
        assert_eq!(config.webhook_template_name(), "webhook-tls-manager-webhook-config");
        assert_eq!(config.ca_common_name(), "webhook-tls-manager_webhook_ca");
        assert_eq!(
            config.server_common_name(),
            "webhook-tls-manager-webhook.kube-system.svc"
        );
        assert_eq!(config.metrics_prefix(), "webhook_tls_manager_metrics");
    }

    #[test]
    fn test_zero_and_empty_flags_keep_defaults() {
        let args = parse(&[
            "--ca-validity-years",
            "0",
            "--server-validity-years",
            "0",
            "--namespace",
            "",
        ]);
        assert_eq!(args.manager_config(), ManagerConfig::default());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "--webhook-tls-manager-managed-object-name",
            "vpa",
            "--namespace",
            "vpa-system",
            "--ca-validity-years",
            "10",
            "--server-validity-years",
            "1",
            "--webhook-tls-manager-enabled=false",
            "--kube-system-namespace-blocked=true",
        ]);
        let config = args.manager_config();
        assert_eq!(config.object_name, "vpa");
        assert_eq!(config.namespace, "vpa-system");
        assert_eq!(config.ca_validity_years, 10);
        assert_eq!(config.server_validity_years, 1);
        assert!(!config.feature_enabled);
        assert!(config.system_namespace_blocked);
        assert_eq!(config.server_common_name(), "vpa-webhook.vpa-system.svc");
    }

    #[test]
    fn test_key_pool_warmup() {
        assert_eq!(parse(&[]).key_pool_warmup(), None);
        assert_eq!(
            parse(&["--key-pool-warmup-secs", "3"]).key_pool_warmup(),
            Some(Duration::from_secs(3))
        );
    }
}
