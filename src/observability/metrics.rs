//! # Metrics
//!
//! Prometheus gauges reporting the outcome of a job run.
//!
//! ## Metrics Exposed
//!
//! Every name starts with the metrics prefix (`<object_name>_metrics`):
//!
//! - `<prefix>_webhook_job_succeed{job}` - Result of the job, 0 is success and 1 is failure
//! - `<prefix>_rotate_certificate_result` - 1 when certificates were rotated, 0 otherwise
//! - `<prefix>_reconcile_attempts_total` - Reconcile attempts made by the job
//!
//! The names depend on the configured object name, so the metrics live in a
//! [`Metrics`] value with its own registry rather than in statics.

use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Job result metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    job_succeed: IntGaugeVec,
    rotate_certificate_result: IntGauge,
    reconcile_attempts_total: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("rotate_certificate_result", &self.rotate_certificate_result.get())
            .field("reconcile_attempts_total", &self.reconcile_attempts_total.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register the metrics under `prefix`
    pub fn new(prefix: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let job_succeed = IntGaugeVec::new(
            Opts::new(
                "webhook_job_succeed",
                "Result of webhook job, 1 is failed and 0 is successful",
            )
            .subsystem(prefix),
            &["job"],
        )?;
        let rotate_certificate_result = IntGauge::with_opts(
            Opts::new(
                "rotate_certificate_result",
                "Whether or not to rotate certificate, 0 is not rotate and 1 is rotate",
            )
            .subsystem(prefix),
        )?;
        let reconcile_attempts_total = IntCounter::with_opts(
            Opts::new(
                "reconcile_attempts_total",
                "Total number of reconcile attempts made by the job",
            )
            .subsystem(prefix),
        )?;

        registry.register(Box::new(job_succeed.clone()))?;
        registry.register(Box::new(rotate_certificate_result.clone()))?;
        registry.register(Box::new(reconcile_attempts_total.clone()))?;

        Ok(Self {
            registry,
            job_succeed,
            rotate_certificate_result,
            reconcile_attempts_total,
        })
    }

    pub fn set_job_result(&self, job: &str, succeeded: bool) {
        self.job_succeed
            .with_label_values(&[job])
            .set(i64::from(!succeeded));
    }

    pub fn set_rotated(&self, rotated: bool) {
        self.rotate_certificate_result.set(i64::from(rotated));
    }

    pub fn add_reconcile_attempts(&self, attempts: u32) {
        self.reconcile_attempts_total.inc_by(u64::from(attempts));
    }

    /// Encode every metric in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new("webhook_tls_manager_metrics").expect("metrics should register")
    }

    #[test]
    fn test_job_result_gauge() {
        let metrics = metrics();
        metrics.set_job_result("reconciliation", true);
        assert_eq!(metrics.job_succeed.with_label_values(&["reconciliation"]).get(), 0);

        metrics.set_job_result("cleanup", false);
        assert_eq!(metrics.job_succeed.with_label_values(&["cleanup"]).get(), 1);
    }

    #[test]
    fn test_rotated_gauge() {
        let metrics = metrics();
        metrics.set_rotated(true);
        assert_eq!(metrics.rotate_certificate_result.get(), 1);
        metrics.set_rotated(false);
        assert_eq!(metrics.rotate_certificate_result.get(), 0);
    }

    #[test]
    fn test_add_reconcile_attempts() {
        let metrics = metrics();
        let before = metrics.reconcile_attempts_total.get();
        metrics.add_reconcile_attempts(3);
        assert_eq!(metrics.reconcile_attempts_total.get(), before + 3);
    }

    #[test]
    fn test_encode_uses_prefixed_names() {
        let metrics = metrics();
        metrics.set_job_result("reconciliation", true);
        metrics.set_rotated(true);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains(
            "webhook_tls_manager_metrics_webhook_job_succeed{job=\"reconciliation\"} 0"
        ));
        assert!(text.contains("webhook_tls_manager_metrics_rotate_certificate_result 1"));
        assert!(text.contains("webhook_tls_manager_metrics_reconcile_attempts_total 0"));
    }

    #[test]
    fn test_invalid_prefix_is_rejected() {
        assert!(Metrics::new("not-valid").is_err());
    }
}
