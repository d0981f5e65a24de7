//! # Key Pool
//!
//! Background pre-generation of RSA private keys.
//!
//! Generating a 4096-bit RSA key takes hundreds of milliseconds to seconds.
//! The pool keeps up to `capacity` keys ready so certificate issuance does not
//! pay that cost on the reconcile path.
//!
//! ## Workers
//!
//! [`KeyPool::run`] is a supervisor loop. On every tick it compares the number
//! of live workers with [`WorkerPolicy::max_workers`] and starts at most one
//! new worker. Workers are numbered from 1 and exit at the top of their loop
//! once their number exceeds the current maximum, so downscaling is
//! cooperative and the live count is only approximately bounded.
//!
//! Each worker generates a key on the blocking thread pool and pushes it into
//! a bounded channel, waiting for space or cancellation. Generation errors and
//! panics are logged, and the worker pauses briefly before trying again.
//!
//! ## Shutdown
//!
//! When the cancellation token fires, `run` waits for every worker, then
//! closes and drains the buffer. From then on [`KeyPool::get_key`] always
//! returns [`KeyPoolError::EmptyPool`] and [`KeyPool::current_size`] is 0.

use crate::constants::{
    KEY_POOL_ERROR_BACKOFF, KEY_POOL_LOG_INTERVAL, KEY_POOL_POLL_INTERVAL, KEY_POOL_WORKER_TICK,
    KEY_SIZE_BITS,
};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Private key handed out by the pool
pub type PrivateKey = PKey<Private>;

/// Key pool errors
#[derive(Debug, Error)]
pub enum KeyPoolError {
    /// No key is buffered right now. Callers fall back to generating one.
    #[error("key pool is empty")]
    EmptyPool,

    #[error("key generation failed: {0}")]
    Generation(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("deadline exceeded waiting for {requested} keys ({current} available)")]
    DeadlineExceeded { requested: usize, current: usize },

    #[error("cancelled waiting for {requested} keys ({current} available)")]
    Cancelled { requested: usize, current: usize },
}

impl KeyPoolError {
    pub fn generation(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Generation(source.into())
    }
}

impl From<openssl::error::ErrorStack> for KeyPoolError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::generation(err)
    }
}

/// Source of new private keys
pub trait KeyGenerator: Send + Sync + 'static {
    fn generate(&self) -> Result<PrivateKey, KeyPoolError>;
}

/// RSA key generator backed by OpenSSL
#[derive(Debug, Clone, Copy)]
pub struct RsaKeyGenerator {
    bits: u32,
}

impl RsaKeyGenerator {
    #[must_use]
    pub fn new(bits: u32) -> Self {
        Self { bits }
    }
}

impl Default for RsaKeyGenerator {
    fn default() -> Self {
        Self::new(KEY_SIZE_BITS)
    }
}

impl KeyGenerator for RsaKeyGenerator {
    fn generate(&self) -> Result<PrivateKey, KeyPoolError> {
        let rsa = Rsa::generate(self.bits)?;
        Ok(PKey::from_rsa(rsa)?)
    }
}

/// Upper bound on the number of concurrent key generation workers
pub trait WorkerPolicy: Send + Sync + 'static {
    fn max_workers(&self) -> i64;
}

/// Constant worker count
#[derive(Debug, Clone, Copy)]
pub struct FixedWorkers(pub i64);

impl WorkerPolicy for FixedWorkers {
    fn max_workers(&self) -> i64 {
        self.0
    }
}

/// Worker count that can be changed while the pool runs
#[derive(Debug, Clone, Default)]
pub struct AdjustableWorkers(Arc<AtomicI64>);

impl AdjustableWorkers {
    #[must_use]
    pub fn new(workers: i64) -> Self {
        Self(Arc::new(AtomicI64::new(workers)))
    }

    pub fn set(&self, workers: i64) {
        self.0.store(workers, Ordering::SeqCst);
    }
}

impl WorkerPolicy for AdjustableWorkers {
    fn max_workers(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl<F> WorkerPolicy for F
where
    F: Fn() -> i64 + Send + Sync + 'static,
{
    fn max_workers(&self) -> i64 {
        self()
    }
}

/// Decrements the live worker count when a worker ends, panics included
struct LiveWorker(Arc<AtomicI64>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of pre-generated private keys
pub struct KeyPool {
    capacity: usize,
    sender: mpsc::Sender<PrivateKey>,
    // Only locked for try_recv / len / close, never across an await
    receiver: Mutex<mpsc::Receiver<PrivateKey>>,
    live_workers: Arc<AtomicI64>,
    generator: Arc<dyn KeyGenerator>,
    policy: Box<dyn WorkerPolicy>,
    worker_tick: Duration,
    span: Span,
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("capacity", &self.capacity)
            .field("size", &self.current_size())
            .field("live_workers", &self.live_workers())
            .field("max_workers", &self.policy.max_workers())
            .finish_non_exhaustive()
    }
}

impl KeyPool {
    /// Create a pool of RSA-4096 keys holding at most `capacity` keys
    ///
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize, policy: impl WorkerPolicy) -> Self {
        Self::with_generator(capacity, policy, RsaKeyGenerator::default())
    }

    pub fn with_generator(
        capacity: usize,
        policy: impl WorkerPolicy,
        generator: impl KeyGenerator,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            capacity,
            sender,
            receiver: Mutex::new(receiver),
            live_workers: Arc::new(AtomicI64::new(0)),
            generator: Arc::new(generator),
            policy: Box::new(policy),
            worker_tick: KEY_POOL_WORKER_TICK,
            span: info_span!("key_pool", capacity),
        }
    }

    /// Override the supervisor tick
    #[must_use]
    pub fn with_worker_tick(mut self, tick: Duration) -> Self {
        self.worker_tick = tick;
        self
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered keys. Advisory only, it may change right after.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.receiver.lock().map_or(0, |receiver| receiver.len())
    }

    /// Number of workers currently running
    #[must_use]
    pub fn live_workers(&self) -> i64 {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Take a buffered key without waiting
    ///
    /// Never generates a key. Returns [`KeyPoolError::EmptyPool`] when nothing
    /// is buffered or the pool has shut down.
    pub fn get_key(&self) -> Result<PrivateKey, KeyPoolError> {
        let Ok(mut receiver) = self.receiver.lock() else {
            return Err(KeyPoolError::EmptyPool);
        };
        receiver.try_recv().ok().ok_or(KeyPoolError::EmptyPool)
    }

    /// Generate one key on the blocking thread pool, bypassing the buffer
    pub async fn generate_single_key(&self) -> Result<PrivateKey, KeyPoolError> {
        let generator = Arc::clone(&self.generator);
        let start = Instant::now();
        let key = tokio::task::spawn_blocking(move || generator.generate())
            .await
            .map_err(KeyPoolError::generation)??;
        info!(parent: &self.span, elapsed_ms = start.elapsed().as_millis(), "Generated private key");
        Ok(key)
    }

    /// Wait until the pool holds `count` keys
    ///
    /// `count` is clamped to the capacity. Polls every 100ms until the target
    /// is reached, the optional timeout elapses or `cancel` fires.
    pub async fn block_until_count(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        count: usize,
    ) -> Result<(), KeyPoolError> {
        if count == 0 {
            return Ok(());
        }
        let requested = if count > self.capacity {
            warn!(
                parent: &self.span,
                "Requested {} keys but the pool only holds {}, waiting for {}",
                count, self.capacity, self.capacity
            );
            self.capacity
        } else {
            count
        };
        if timeout.is_none() {
            warn!(parent: &self.span, "Waiting for {} keys without a timeout", requested);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut poll = tokio::time::interval(KEY_POOL_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let current = self.current_size();
            if current >= requested {
                debug!(parent: &self.span, "Key pool reached {} keys", current);
                return Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(KeyPoolError::DeadlineExceeded { requested, current });
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(KeyPoolError::Cancelled {
                        requested,
                        current: self.current_size(),
                    });
                }
                _ = poll.tick() => {}
            }
        }
    }

    /// Run the worker supervisor until `cancel` fires
    ///
    /// Returns after every worker has stopped and the buffer is drained.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            info!("Starting key pool (max workers: {})", self.policy.max_workers());
            let mut workers = JoinSet::new();
            let mut supervise = tokio::time::interval(self.worker_tick);
            supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut report = tokio::time::interval(KEY_POOL_LOG_INTERVAL);
            report.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = supervise.tick() => {
                        self.spawn_worker_if_needed(&mut workers, &cancel);
                    }
                    _ = report.tick() => {
                        info!(
                            size = self.current_size(),
                            live_workers = self.live_workers(),
                            "Key pool status"
                        );
                    }
                    Some(joined) = workers.join_next() => {
                        if let Err(e) = joined {
                            error!("Key pool worker failed: {}", e);
                        }
                    }
                }
            }

            info!("Stopping key pool, waiting for {} workers", workers.len());
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("Key pool worker failed: {}", e);
                }
            }
            let drained = self.drain();
            info!("Key pool stopped, discarded {} keys", drained);
        }
        .instrument(span)
        .await;
    }

    /// Start one worker when fewer than `max_workers()` are live
    fn spawn_worker_if_needed(
        self: &Arc<Self>,
        workers: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> bool {
        let max = self.policy.max_workers();
        let live = self.live_workers();
        if live >= max {
            return false;
        }
        let id = self.live_workers.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = LiveWorker(Arc::clone(&self.live_workers));
        debug!("Starting key pool worker {} ({} live, max {})", id, live, max);
        workers.spawn(
            Arc::clone(self)
                .worker(id, guard, cancel.clone())
                .instrument(self.span.clone()),
        );
        true
    }

    async fn worker(self: Arc<Self>, id: i64, _guard: LiveWorker, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let max = self.policy.max_workers();
            if id > max {
                debug!("Key pool worker {} exiting (max workers: {})", id, max);
                return;
            }

            let generator = Arc::clone(&self.generator);
            let generated = tokio::select! {
                () = cancel.cancelled() => return,
                generated = tokio::task::spawn_blocking(move || generator.generate()) => generated,
            };
            let key = match generated {
                Ok(Ok(key)) => key,
                Ok(Err(e)) => {
                    warn!("Key pool worker {} failed to generate a key: {}", id, e);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(KEY_POOL_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!("Key pool worker {} recovered from a panic: {}", id, e);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(KEY_POOL_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            tokio::select! {
                () = cancel.cancelled() => return,
                sent = self.sender.send(key) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Close the buffer and drop every key left in it
    fn drain(&self) -> usize {
        let Ok(mut receiver) = self.receiver.lock() else {
            return 0;
        };
        receiver.close();
        let mut drained = 0;
        while receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> PrivateKey {
        RsaKeyGenerator::new(1024).generate().expect("key should generate")
    }

    /// Hands out clones of one key, optionally slowly
    struct CloneGenerator {
        key: PrivateKey,
        delay: Duration,
    }

    impl CloneGenerator {
        fn new(delay: Duration) -> Self {
            Self {
                key: test_key(),
                delay,
            }
        }
    }

    impl KeyGenerator for CloneGenerator {
        fn generate(&self) -> Result<PrivateKey, KeyPoolError> {
            std::thread::sleep(self.delay);
            Ok(self.key.clone())
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_worker_policies() {
        assert_eq!(FixedWorkers(3).max_workers(), 3);

        let adjustable = AdjustableWorkers::new(1);
        let handle = adjustable.clone();
        handle.set(4);
        assert_eq!(adjustable.max_workers(), 4);

        let closure = || 2;
        assert_eq!(closure.max_workers(), 2);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let pool = KeyPool::with_generator(0, FixedWorkers(1), CloneGenerator::new(Duration::ZERO));
        assert_eq!(pool.capacity(), 1);
    }

    #[tokio::test]
    async fn test_supervisor_starts_one_worker_per_call() {
        // Generator blocks long enough that no worker reaches the push
        let pool = Arc::new(KeyPool::with_generator(
            1,
            FixedWorkers(3),
            CloneGenerator::new(Duration::from_millis(200)),
        ));
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        for expected in 1..=3 {
            assert!(pool.spawn_worker_if_needed(&mut workers, &cancel));
            assert_eq!(pool.live_workers(), expected);
        }
        assert!(!pool.spawn_worker_if_needed(&mut workers, &cancel));
        assert_eq!(pool.live_workers(), 3);

        cancel.cancel();
        while workers.join_next().await.is_some() {}
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_workers_scale_down_cooperatively() {
        let policy = AdjustableWorkers::new(3);
        let pool = Arc::new(
            KeyPool::with_generator(
                10_000,
                policy.clone(),
                CloneGenerator::new(Duration::from_millis(2)),
            )
            .with_worker_tick(Duration::from_millis(10)),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&pool).run(cancel.clone()));

        wait_for(|| pool.live_workers() == 3).await;
        policy.set(1);
        wait_for(|| pool.live_workers() == 1).await;

        policy.set(2);
        wait_for(|| pool.live_workers() == 2).await;

        cancel.cancel();
        run.await.expect("supervisor should not panic");
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_pool_on_cancel() {
        let pool = Arc::new(
            KeyPool::with_generator(3, FixedWorkers(2), CloneGenerator::new(Duration::ZERO))
                .with_worker_tick(Duration::from_millis(10)),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&pool).run(cancel.clone()));

        wait_for(|| pool.current_size() == 3).await;
        cancel.cancel();
        run.await.expect("supervisor should not panic");

        assert_eq!(pool.current_size(), 0);
        assert!(matches!(pool.get_key(), Err(KeyPoolError::EmptyPool)));
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_workers_survive_panics_and_errors() {
        /// Panics on the first call, fails on the second, then succeeds
        struct Flaky {
            calls: AtomicI64,
            key: PrivateKey,
        }
        impl KeyGenerator for Flaky {
            fn generate(&self) -> Result<PrivateKey, KeyPoolError> {
                match self.calls.fetch_add(1, Ordering::SeqCst) {
                    0 => panic!("first key exploded"),
                    1 => Err(KeyPoolError::generation("second key failed")),
                    _ => Ok(self.key.clone()),
                }
            }
        }

        let pool = Arc::new(
            KeyPool::with_generator(
                2,
                FixedWorkers(1),
                Flaky {
                    calls: AtomicI64::new(0),
                    key: test_key(),
                },
            )
            .with_worker_tick(Duration::from_millis(10)),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&pool).run(cancel.clone()));

        wait_for(|| pool.current_size() == 2).await;
        assert_eq!(pool.live_workers(), 1);

        cancel.cancel();
        run.await.expect("supervisor should not panic");
    }

    #[tokio::test]
    async fn test_panicking_generator_is_backed_off() {
        struct AlwaysPanics(Arc<AtomicI64>);
        impl KeyGenerator for AlwaysPanics {
            fn generate(&self) -> Result<PrivateKey, KeyPoolError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                panic!("generator always panics");
            }
        }

        let calls = Arc::new(AtomicI64::new(0));
        let pool = Arc::new(
            KeyPool::with_generator(1, FixedWorkers(1), AlwaysPanics(Arc::clone(&calls)))
                .with_worker_tick(Duration::from_millis(10)),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&pool).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        run.await.expect("supervisor should not panic");

        // One call per 50ms backoff at most, plus slack for scheduling
        let calls = calls.load(Ordering::SeqCst);
        assert!(calls >= 1, "generator should have been called");
        assert!(calls <= 15, "generator called {calls} times in 500ms");
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_generate_single_key_reports_panic() {
        struct Panicking;
        impl KeyGenerator for Panicking {
            fn generate(&self) -> Result<PrivateKey, KeyPoolError> {
                panic!("entropy source exploded");
            }
        }

        let pool = KeyPool::with_generator(1, FixedWorkers(0), Panicking);
        let err = pool.generate_single_key().await.expect_err("panic should surface");
        assert!(matches!(err, KeyPoolError::Generation(_)));
    }
}
