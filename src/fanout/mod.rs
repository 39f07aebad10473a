//! Fan-out helpers: process a whole collection while tracking progress.
//!
//! Three modes share one shape. Every item is dispatched, a shared
//! [`ProgressLatch`] counts outstanding items, and a [`Ticker`] reports
//! progress until the latch reaches zero. The first failure from any item is
//! raised on the next tick and fails the whole operation. Items already
//! dispatched keep running; nothing is aborted.
//!
//! - [`FanOut::process`] spawns one task per item with no concurrency bound.
//! - [`FanOut::process_queued`] routes every item through a [`WorkerPool`].
//! - [`FanOut::process_batches`] hands fixed-size chunks to a handler along
//!   with a [`SubLatch`] the handler must signal once per item.

pub mod ticker;

pub use ticker::{FirstFailure, Ticker};

use crate::config::ServiceConfig;
use crate::engine::WorkerPool;
use crate::error::{Error, Result};
use crate::latch::{ProgressLatch, SubLatch};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FanOut {
    tick_interval: Duration,
    batch_yield: Duration,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            batch_yield: config.batch_yield,
        }
    }

    /// Set the interval between progress callbacks.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the pause between batches.
    pub fn batch_yield(mut self, pause: Duration) -> Self {
        self.batch_yield = pause;
        self
    }

    fn ticker(&self) -> Ticker {
        Ticker::new(self.tick_interval)
    }

    /// Run `work` for every item concurrently, one spawned task per item.
    ///
    /// Waits for every spawned item before returning, even after a failure.
    pub async fn process<I, T, W, Fut, P>(&self, items: I, mut work: W, on_tick: P) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        W: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        P: FnMut(&ProgressLatch) -> anyhow::Result<()>,
    {
        let items: Vec<T> = items.into_iter().collect();
        let latch = Arc::new(ProgressLatch::new(items.len()));
        let failures = Arc::new(FirstFailure::default());
        record_items("direct", items.len());

        let mut tasks = JoinSet::new();
        for item in items {
            let fut = work(item);
            let latch = Arc::clone(&latch);
            let failures = Arc::clone(&failures);
            tasks.spawn(async move {
                let outcome = match fut.await {
                    Ok(()) => latch.signal().map(|_| ()),
                    Err(e) => Err(Error::Work(e)),
                };
                if let Err(e) = outcome {
                    failures.record(e);
                }
            });
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    failures.record(Error::Work(anyhow::Error::new(e)));
                }
            }
        };
        let ticker = self.ticker();
        let never = CancellationToken::new();
        let (ticked, ()) = tokio::join!(ticker.run(&latch, &failures, &never, on_tick), drain);
        settle(ticked, &failures)
    }

    /// Submit `work` for every item to `pool` and tick until all are done.
    ///
    /// Returns as soon as every item has finished, the first failure has been
    /// raised, or the pool's service is disposed. On failure the remaining
    /// submissions stay queued and still run.
    pub async fn process_queued<I, T, W, Fut, P>(
        &self,
        pool: &WorkerPool,
        items: I,
        mut work: W,
        on_tick: P,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        W: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        P: FnMut(&ProgressLatch) -> anyhow::Result<()>,
    {
        let items: Vec<T> = items.into_iter().collect();
        let latch = Arc::new(ProgressLatch::new(items.len()));
        let failures = Arc::new(FirstFailure::default());
        record_items("queued", items.len());
        debug!(kind = %pool.spec().name, items = items.len(), "queued fan-out started");

        for item in items {
            let fut = work(item);
            let latch = Arc::clone(&latch);
            let failures = Arc::clone(&failures);
            pool.submit(
                move |_token| async move {
                    fut.await?;
                    latch.signal()?;
                    Ok::<(), anyhow::Error>(())
                },
                move |e| {
                    failures.record(e);
                },
            );
        }

        let ticker = self.ticker();
        let ticked = ticker
            .run(&latch, &failures, pool.cancellation_token(), on_tick)
            .await;
        settle(ticked, &failures)
    }

    /// Split the items into chunks of `batch_size` (the last may be shorter)
    /// and hand each chunk to `handler` with a [`SubLatch`] sized to it.
    ///
    /// Chunks run one after another. A handler that returns without
    /// signalling its sub-latch down to zero fails the operation with
    /// [`Error::BatchUnderflow`]; the remaining chunks are still processed.
    /// An empty collection completes immediately.
    pub async fn process_batches<I, T, H, Fut, P>(
        &self,
        items: I,
        batch_size: usize,
        mut handler: H,
        on_tick: P,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        H: FnMut(Vec<T>, Arc<SubLatch>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
        P: FnMut(&ProgressLatch) -> anyhow::Result<()>,
    {
        if batch_size == 0 {
            return Err(Error::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }
        let items: Vec<T> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }
        let latch = Arc::new(ProgressLatch::new(items.len()));
        let failures = FirstFailure::default();
        record_items("batch", items.len());

        let batches = chunk(items, batch_size);
        let run = async {
            for (index, batch) in batches.into_iter().enumerate() {
                let size = batch.len();
                let sub = Arc::new(SubLatch::new(Arc::clone(&latch), size));
                match handler(batch, Arc::clone(&sub)).await {
                    Ok(()) => {
                        let remaining = sub.current();
                        if remaining != 0 {
                            warn!(batch = index, size, remaining, "batch returned without signalling every item");
                            failures.record(Error::BatchUnderflow { size, remaining });
                        }
                    }
                    Err(e) => {
                        failures.record(Error::Work(e));
                    }
                }
                tokio::time::sleep(self.batch_yield).await;
            }
        };

        let ticker = self.ticker();
        let never = CancellationToken::new();
        let (ticked, ()) = tokio::join!(ticker.run(&latch, &failures, &never, on_tick), run);
        settle(ticked, &failures)
    }
}

/// A failure may be recorded after the ticker already saw the latch reach zero.
fn settle(ticked: Result<()>, failures: &FirstFailure) -> Result<()> {
    ticked?;
    match failures.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

fn record_items(mode: &'static str, count: usize) {
    metrics::fanout_items().add(count as u64, &[KeyValue::new("mode", mode)]);
}
