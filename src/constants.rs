//! # Constants
//!
//! Shared constants used throughout the manager.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration where applicable.

use std::time::Duration;

/// Label key marking objects owned by this manager
pub const MANAGED_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Label value marking objects owned by this manager
pub const MANAGED_LABEL_VALUE: &str = "aks";

/// Label that disables admission enforcement for the system namespace
pub const ADMISSION_ENFORCER_DISABLED_LABEL: &str = "admissions.enforcer/disabled";

/// Value of [`ADMISSION_ENFORCER_DISABLED_LABEL`] when enforcement is disabled
pub const ADMISSION_ENFORCER_DISABLED_VALUE: &str = "true";

/// Job label value for the reconciliation job
pub const RECONCILIATION_JOB: &str = "reconciliation";

/// Job label value for the cleanup job (feature disabled)
pub const CLEANUP_JOB: &str = "cleanup";

/// Secret data keys
pub const CA_CERT_KEY: &str = "caCert.pem";
pub const CA_KEY_KEY: &str = "caKey.pem";
pub const SERVER_CERT_KEY: &str = "serverCert.pem";
pub const SERVER_KEY_KEY: &str = "serverKey.pem";

/// ConfigMap key holding the desired MutatingWebhookConfiguration (YAML or JSON)
pub const WEBHOOK_TEMPLATE_KEY: &str = "mutatingWebhookConfig";

/// Default name stem for every managed object
pub const DEFAULT_OBJECT_NAME: &str = "webhook-tls-manager";

/// Default namespace of the managed secret and the webhook template
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Default CA certificate lifetime (years)
pub const DEFAULT_CA_VALIDITY_YEARS: u32 = 30;

/// Default server certificate lifetime (years)
pub const DEFAULT_SERVER_VALIDITY_YEARS: u32 = 2;

/// Allowed clock skew between issuer and verifier, subtracted from `notBefore`
pub const CLOCK_SKEW: Duration = Duration::from_secs(10 * 60);

/// Rotation lead time in calendar months before `notAfter`
pub const ROTATION_LEAD_MONTHS: u32 = 1;

/// RSA key size for generated keys
pub const KEY_SIZE_BITS: u32 = 4096;

/// Synchronous key generation attempts when the key pool is empty
pub const KEY_RETRY_COUNT: u32 = 3;

/// Delay between synchronous key generation attempts
pub const KEY_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Maximum reconcile attempts per job
pub const RECONCILE_RETRY_COUNT: u32 = 10;

/// Delay between reconcile attempts
pub const RECONCILE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Wall-clock budget for all reconcile attempts
pub const RECONCILE_RETRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Key pool supervisor tick
pub const KEY_POOL_WORKER_TICK: Duration = Duration::from_secs(5);

/// Key pool size log interval
pub const KEY_POOL_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval of `KeyPool::block_until_count`
pub const KEY_POOL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a failed key generation so a broken generator cannot spin
pub const KEY_POOL_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Default key pool capacity
pub const DEFAULT_KEY_POOL_SIZE: usize = 2;

/// Default key pool worker count
pub const DEFAULT_KEY_POOL_WORKERS: i64 = 1;

/// Default metrics listener address
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8943";
