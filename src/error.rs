//! Error types for the webhook TLS manager

use crate::certificates::issuer::IssuanceError;
use crate::cluster::ClusterError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a goal resolution or a reconcile attempt
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Object store failure other than an expected not-found
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Key generation or signing failed
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    /// Stored certificate or webhook template cannot be used
    #[error("malformed state: {0}")]
    MalformedState(String),

    /// The retry budget ran out before an attempt succeeded
    #[error("reconcile timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        elapsed: Duration,
        attempts: u32,
        #[source]
        last_error: Option<Box<Error>>,
    },

    /// The caller cancelled reconciliation
    #[error("reconcile cancelled")]
    Cancelled,
}

impl Error {
    /// Create a malformed state error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedState(msg.into())
    }

    /// Whether this error came from the object store
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }
}

/// Result type for resolution and reconciliation
pub type Result<T, E = Error> = std::result::Result<T, E>;
