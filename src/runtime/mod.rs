//! # Runtime
//!
//! Wires the job together and runs it once.
//!
//! 1. rustls provider, tracing and build info
//! 2. Metrics and the health server
//! 3. Kubernetes client and the key pool
//! 4. Issuer, goal resolver and reconciler
//! 5. Reconcile, record the outcome in the gauges, stop the key pool
//!
//! SIGTERM or SIGINT cancels one shutdown token. The key pool runs on a child
//! of it and the reconciler checks it between attempts, so a signal during the
//! retry sleep ends the job with a failure and the pool still drains.
//!
//! The process exit status reflects the reconcile result only.

use crate::certificates::CertificateIssuer;
use crate::cluster::{ClusterStore, KubeClusterStore};
use crate::config::{Args, ManagerConfig};
use crate::constants::{CLEANUP_JOB, RECONCILIATION_JOB};
use crate::goal::{GoalResolver, Resolve};
use crate::keypool::{FixedWorkers, KeyPool};
use crate::observability::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::server::{start_server, ServerState};
use anyhow::{anyhow, Context, Result};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Background key pool and the token that stops it
struct RunningPool {
    pool: Arc<KeyPool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningPool {
    fn start(size: usize, workers: i64, shutdown: &CancellationToken) -> Self {
        let pool = Arc::new(KeyPool::new(size, FixedWorkers(workers)));
        let cancel = shutdown.child_token();
        let handle = tokio::spawn(Arc::clone(&pool).run(cancel.clone()));
        Self {
            pool,
            cancel,
            handle,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Key pool task failed: {}", e);
        }
    }
}

/// Cancel `shutdown` and mark the server not ready on SIGTERM or SIGINT
fn cancel_on_signal(shutdown: CancellationToken, server_state: Arc<ServerState>) {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = shutdown_signal() => {}
        }
        info!("Received shutdown signal (SIGINT/SIGTERM), cancelling reconciliation");
        server_state.is_ready.store(false, Ordering::Relaxed);
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler, only SIGINT is handled: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Run the job
///
/// Returns `Ok(true)` when reconciliation succeeded and `Ok(false)` when it
/// failed after exhausting its retries. Startup failures are errors.
pub async fn run(args: Args) -> Result<bool> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_provider| anyhow!("Failed to install rustls crypto provider"))?;

    observability::init_tracing(&args.log_level, args.log_format)
        .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))?;

    info!("Starting webhook TLS manager");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let config = Arc::new(args.manager_config());
    info!(
        "Managing {}/{} (enabled: {}, kube-system blocked: {})",
        config.namespace,
        config.object_name,
        config.feature_enabled,
        config.system_namespace_blocked
    );

    let metrics = Arc::new(
        Metrics::new(&config.metrics_prefix()).context("Failed to register metrics")?,
    );
    let server_state = Arc::new(ServerState::new(Arc::clone(&metrics)));
    let metrics_addr = args.metrics_addr;
    let server_state_clone = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = start_server(metrics_addr, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store: Arc<dyn ClusterStore> = Arc::new(KubeClusterStore::new(client));
    server_state.mark_ready();

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone(), Arc::clone(&server_state));

    let pool = (args.key_pool_size > 0)
        .then(|| RunningPool::start(args.key_pool_size, args.key_pool_workers, &shutdown));
    if let (Some(running), Some(warmup)) = (&pool, args.key_pool_warmup()) {
        if let Err(e) = running
            .pool
            .block_until_count(&running.cancel, Some(warmup), running.pool.capacity())
            .await
        {
            warn!("Key pool warmup incomplete: {}", e);
        }
    }

    let issuer = CertificateIssuer::new(pool.as_ref().map(|running| Arc::clone(&running.pool)));
    let succeeded = reconcile(&config, store, issuer, &metrics, &shutdown).await;

    if let Some(running) = pool {
        running.stop().await;
    }
    // Stops the signal listener
    shutdown.cancel();
    Ok(succeeded)
}

/// Run the reconciler and record the outcome in `metrics`
async fn reconcile(
    config: &Arc<ManagerConfig>,
    store: Arc<dyn ClusterStore>,
    issuer: CertificateIssuer,
    metrics: &Metrics,
    shutdown: &CancellationToken,
) -> bool {
    let resolver: Arc<dyn Resolve> = Arc::new(GoalResolver::new(
        Arc::clone(config),
        Arc::clone(&store),
        issuer,
    ));
    let reconciler = Reconciler::new(Arc::clone(config), store, resolver);
    let job = if config.feature_enabled {
        RECONCILIATION_JOB
    } else {
        CLEANUP_JOB
    };

    let result = reconciler.reconcile(shutdown).await;
    metrics.add_reconcile_attempts(reconciler.attempts());
    match result {
        Ok(outcome) => {
            metrics.set_job_result(job, true);
            metrics.set_rotated(outcome.rotated);
            info!(
                "Webhook {} job succeeded after {} attempts (rotated: {})",
                job, outcome.attempts, outcome.rotated
            );
            true
        }
        Err(e) => {
            metrics.set_job_result(job, false);
            metrics.set_rotated(false);
            error!("Webhook {} job failed: {}", job, e);
            false
        }
    }
}
