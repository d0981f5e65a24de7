//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use webhook_tls_manager::prelude::*;
//! ```

pub use crate::certificates::{CertificateIssuer, IssuanceError, IssuedCertificate};
pub use crate::cluster::{ClusterError, ClusterStore, KubeClusterStore};
pub use crate::config::{ManagerConfig, RetryPolicy};
pub use crate::error::{Error, Result};
pub use crate::goal::{CertificateMaterial, Goal, GoalResolver, Resolve};
pub use crate::keypool::{
    AdjustableWorkers, FixedWorkers, KeyGenerator, KeyPool, KeyPoolError, RsaKeyGenerator,
    WorkerPolicy,
};
pub use crate::reconciler::{ReconcileOutcome, Reconciler};
