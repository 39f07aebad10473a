//! Queue service: the registry of worker pools, one per queue kind.
//!
//! The service owns the master cancellation signal. Pools are created on
//! first use and live as long as the service. Construct one per application
//! and share it by reference (or `Arc`) with whatever submits work.

use crate::config::ServiceConfig;
use crate::engine::pool::WorkerPool;
use crate::engine::work::Completion;
use crate::error::{Error, Result};
use crate::kind::{KindKey, KindSpec, QueueKind};
use crate::model::PoolSnapshot;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registry of worker pools keyed by queue kind.
///
/// ```no_run
/// use fnqueue::config::ServiceConfig;
/// use fnqueue::engine::QueueService;
/// use fnqueue::kind::QueueKind;
///
/// struct Emails;
/// impl QueueKind for Emails {
///     const MAX_WORKERS: usize = 2;
/// }
///
/// # async fn example() -> fnqueue::error::Result<()> {
/// let service = QueueService::new(ServiceConfig::default())?;
/// service
///     .submit_awaitable::<Emails, _, _>(|_token| async { Ok(()) })
///     .await?;
/// service.dispose();
/// # Ok(())
/// # }
/// ```
pub struct QueueService {
    pools: DashMap<KindKey, WorkerPool>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    runtime: Handle,
    config: ServiceConfig,
}

impl QueueService {
    /// Create a service bound to the current tokio runtime.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("queue service needs a tokio runtime: {e}")))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a service whose workers run on the given runtime.
    pub fn with_runtime(config: ServiceConfig, runtime: Handle) -> Self {
        Self {
            pools: DashMap::new(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            runtime,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The pool for a static kind, created on first use.
    pub fn pool<K: QueueKind>(&self) -> WorkerPool {
        self.get_or_create(KindKey::of::<K>(), K::spec)
    }

    /// The pool for a runtime-declared kind, created on first use.
    ///
    /// The spec used is the one from the first call for that name.
    pub fn pool_for(&self, spec: &KindSpec) -> Result<WorkerPool> {
        spec.validate()?;
        Ok(self.get_or_create(KindKey::named(spec), || spec.clone()))
    }

    fn get_or_create(&self, key: KindKey, spec: impl FnOnce() -> KindSpec) -> WorkerPool {
        // Fast path without taking the shard write lock.
        if let Some(pool) = self.pools.get(&key) {
            return pool.clone();
        }
        self.pools
            .entry(key)
            .or_insert_with(|| {
                let spec = spec();
                debug!(
                    kind = %spec.name,
                    max_workers = spec.max_workers,
                    dedicated_thread = spec.dedicated_thread,
                    "creating worker pool"
                );
                WorkerPool::new(
                    spec,
                    self.cancel.clone(),
                    self.runtime.clone(),
                    self.config.poll_timeout,
                )
            })
            .clone()
    }

    /// Fire-and-forget: enqueue `action` on kind `K`'s pool and return immediately.
    pub fn submit<K, F, Fut>(&self, action: F, on_failure: impl FnOnce(Error) + Send + 'static)
    where
        K: QueueKind,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pool::<K>().submit(action, on_failure);
    }

    /// Enqueue `action` on kind `K`'s pool and return a handle to await it.
    pub fn submit_awaitable<K, F, Fut>(&self, action: F) -> Completion
    where
        K: QueueKind,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pool::<K>().submit_awaitable(action)
    }

    /// Fire-and-forget submission of a synchronous closure.
    pub fn submit_blocking<K, F>(&self, f: F, on_failure: impl FnOnce(Error) + Send + 'static)
    where
        K: QueueKind,
        F: FnOnce(CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        self.pool::<K>().submit_blocking(f, on_failure);
    }

    /// Awaitable submission of a synchronous closure.
    pub fn submit_blocking_awaitable<K, F>(&self, f: F) -> Completion
    where
        K: QueueKind,
        F: FnOnce(CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        self.pool::<K>().submit_blocking_awaitable(f)
    }

    /// Fire-and-forget submission to a runtime-declared kind.
    pub fn submit_to<F, Fut>(
        &self,
        spec: &KindSpec,
        action: F,
        on_failure: impl FnOnce(Error) + Send + 'static,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pool_for(spec)?.submit(action, on_failure);
        Ok(())
    }

    /// Awaitable submission to a runtime-declared kind.
    pub fn submit_awaitable_to<F, Fut>(&self, spec: &KindSpec, action: F) -> Result<Completion>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Ok(self.pool_for(spec)?.submit_awaitable(action))
    }

    /// Snapshots of every pool created so far, sorted by kind name.
    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<_> = self.pools.iter().map(|p| p.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.kind.cmp(&b.kind));
        snapshots
    }

    /// The master cancellation signal handed to every action.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fire the master cancellation signal. Idempotent.
    ///
    /// Cancellation is cooperative: running actions are not aborted, idle
    /// workers stop, no new workers start, and awaitable handles whose item
    /// is still waiting fail with [`Error::Cancelled`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pools = self.pools.len(), "disposing queue service");
        self.cancel.cancel();
    }
}

impl Drop for QueueService {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("pools", &self.pools.len())
            .field("disposed", &self.is_disposed())
            .field("config", &self.config)
            .finish()
    }
}
