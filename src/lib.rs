//! Webhook TLS Manager Library
//!
//! Keeps the serving certificate of an admission webhook valid and its
//! `MutatingWebhookConfiguration` in sync with a template and the current CA.
//! Tests are included in the module files.
//!
//! ## Components
//!
//! - [`keypool`]: background RSA key pre-generation
//! - [`certificates`]: CA and serving certificate issuance, expiry checks
//! - [`goal`]: decides whether certificates must be rotated
//! - [`reconciler`]: applies the goal to the cluster with retries
//! - [`cluster`]: object store seam over the Kubernetes API
//!
//! The binary runs one reconciliation per invocation, see [`runtime::run`].

pub mod certificates;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod goal;
pub mod keypool;
pub mod observability;
pub mod prelude;
pub mod reconciler;
pub mod runtime;
pub mod server;

pub use error::{Error, Result};
