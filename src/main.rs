//! # Webhook TLS Manager
//!
//! A Kubernetes job that rotates the TLS certificates of an admission webhook
//! and reconciles its `MutatingWebhookConfiguration`.
//!
//! ## Overview
//!
//! Each run:
//!
//! 1. **Checks the serving certificate** - Reads the managed secret and rotates when
//!    the certificate expires within a month, or the secret is missing
//! 2. **Issues certificates** - A self-signed CA and a serving certificate signed by it
//! 3. **Updates the webhook configuration** - Renders the template ConfigMap with the
//!    CA bundle and the namespace labels, and writes it when it drifted
//! 4. **Cleans up** - When disabled, deletes the managed secret and webhook configuration
//!
//! The process exits non-zero when reconciliation fails after its retries.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use webhook_tls_manager::config::Args;
use webhook_tls_manager::runtime;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    if runtime::run(args).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
