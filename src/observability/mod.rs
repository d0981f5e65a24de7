//! # Observability
//!
//! Logging setup and job metrics.
//!
//! - `metrics`: Prometheus gauges for the job outcome

pub mod metrics;

pub use metrics::Metrics;

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set, otherwise the crate logs at `log_level`.
/// Returns an error if a subscriber was already installed.
pub fn init_tracing(
    log_level: &str,
    format: LogFormat,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("webhook_tls_manager={log_level}").into());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
