//! Per-kind worker pool.
//!
//! A pool owns a lock-free FIFO of [`PendingWork`] and runs between zero and
//! `max_workers` worker loops over it. Workers start lazily when work is
//! added and retire after sitting idle for one poll timeout.
//!
//! The active-worker count is guarded by a mutex, and every compound
//! operation on it happens inside that one critical section:
//!
//! - starting a worker checks `active < max_workers` and increments;
//! - retiring re-checks the queue and either claims the item that raced in
//!   or decrements.
//!
//! Because a producer pushes before it takes the lock, either the retiring
//! worker sees the new item, or the producer sees the decremented count and
//! starts a replacement. No item is left behind with no worker to run it.

use crate::engine::work::{Action, Completion, FailureHandler, PendingWork};
use crate::error::Error;
use crate::kind::KindSpec;
use crate::model::{PoolSnapshot, WorkState};
use crate::telemetry::metrics::{self, kind_label};
use crate::telemetry::work::{record_state_transition, start_work_span, start_worker_span};
use chrono::Utc;
use crossbeam_queue::SegQueue;
use futures::FutureExt;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

/// Handle to one kind's pool. Clones share the same queue and workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    spec: KindSpec,
    queue: SegQueue<PendingWork>,
    active: Mutex<usize>,
    available: Notify,
    cancel: CancellationToken,
    runtime: Handle,
    poll_timeout: Duration,
    next_worker: AtomicU64,
}

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Idle,
    Cancelled,
}

impl Exit {
    fn reason(self) -> &'static str {
        match self {
            Exit::Idle => "idle",
            Exit::Cancelled => "cancelled",
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(
        spec: KindSpec,
        cancel: CancellationToken,
        runtime: Handle,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                spec,
                queue: SegQueue::new(),
                active: Mutex::new(0),
                available: Notify::new(),
                cancel,
                runtime,
                poll_timeout,
                next_worker: AtomicU64::new(0),
            }),
        }
    }

    pub fn spec(&self) -> &KindSpec {
        &self.inner.spec
    }

    /// Workers currently running, always within `0..=max_workers`.
    pub fn active_workers(&self) -> usize {
        *self.inner.active.lock()
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            kind: self.inner.spec.name.clone(),
            max_workers: self.inner.spec.max_workers,
            active_workers: self.active_workers(),
            queued: self.queued(),
            dedicated_thread: self.inner.spec.dedicated_thread,
        }
    }

    /// The master signal shared with the owning service.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Enqueue an item and start a worker if the pool has spare capacity.
    ///
    /// After disposal the item is not run: it finishes at once with
    /// [`Error::Cancelled`], delivered to its failure handler or handle.
    pub fn add_work(&self, work: PendingWork) {
        let kind = &self.inner.spec.name;
        debug!(kind = %kind, work_id = %work.id(), "work enqueued");
        self.inner.queue.push(work);
        metrics::work_submitted().add(1, &[kind_label(kind)]);
        self.inner.available.notify_one();
        self.inner.try_start_worker();
        // Checked after the push: a disposal racing this call is either seen
        // here or by a running worker, which drains the queue on its way out.
        if self.inner.cancel.is_cancelled() {
            self.inner.cancel_queued();
        }
    }

    /// Fire-and-forget submission. `on_failure` sees the action's error, if any.
    pub fn submit<F, Fut>(&self, action: F, on_failure: impl FnOnce(Error) + Send + 'static)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let on_failure: FailureHandler = Box::new(on_failure);
        self.add_work(PendingWork::with_callback(boxed(action), on_failure));
    }

    /// Awaitable submission.
    pub fn submit_awaitable<F, Fut>(&self, action: F) -> Completion
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (work, completion) = PendingWork::awaitable(boxed(action), self.inner.cancel.clone());
        self.add_work(work);
        completion
    }

    /// Fire-and-forget submission of a synchronous closure. It runs on the
    /// blocking thread pool while occupying one of this pool's worker slots.
    pub fn submit_blocking<F>(&self, f: F, on_failure: impl FnOnce(Error) + Send + 'static)
    where
        F: FnOnce(CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        let on_failure: FailureHandler = Box::new(on_failure);
        self.add_work(PendingWork::with_callback(blocking(f), on_failure));
    }

    /// Awaitable submission of a synchronous closure.
    pub fn submit_blocking_awaitable<F>(&self, f: F) -> Completion
    where
        F: FnOnce(CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        let (work, completion) = PendingWork::awaitable(blocking(f), self.inner.cancel.clone());
        self.add_work(work);
        completion
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("spec", &self.inner.spec)
            .field("active_workers", &self.active_workers())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Erase an async action into an [`Action`].
pub fn boxed<F, Fut>(action: F) -> Action
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |token| action(token).boxed())
}

/// Erase a synchronous closure into an [`Action`] that runs on the blocking pool.
pub fn blocking<F>(f: F) -> Action
where
    F: FnOnce(CancellationToken) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(move |token| {
        async move {
            match tokio::task::spawn_blocking(move || f(token)).await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::Error::new(e).context("blocking work did not complete")),
            }
        }
        .boxed()
    })
}

/// One counted worker slot. Releases its count exactly once: on idle
/// retirement under the pool lock, or on drop for every other exit path
/// (cancellation, unwinding, a task dropped by a shutting-down runtime).
struct WorkerSlot {
    pool: Arc<PoolInner>,
    worker: u64,
    held: AtomicBool,
    /// The item this worker is currently running.
    current: Mutex<Option<PendingWork>>,
}

impl WorkerSlot {
    /// Caller must hold the pool's `active` lock.
    fn release_locked(&self, active: &mut usize) {
        if self.held.swap(false, Ordering::AcqRel) {
            *active -= 1;
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.held.swap(false, Ordering::AcqRel) {
            *self.pool.active.lock() -= 1;
        }
    }
}

impl PoolInner {
    /// Reserve a slot and launch a worker, unless the pool is full or the
    /// service has been disposed.
    fn try_start_worker(self: &Arc<Self>) -> bool {
        {
            let mut active = self.active.lock();
            if self.cancel.is_cancelled() || *active >= self.spec.max_workers {
                return false;
            }
            *active += 1;
        }

        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let slot = WorkerSlot {
            pool: Arc::clone(self),
            worker,
            held: AtomicBool::new(true),
            current: Mutex::new(None),
        };

        // On failure the slot is dropped with the closure and releases itself.
        // The next add_work retries the start.
        match self.launch(slot) {
            Ok(()) => {
                metrics::workers_started().add(1, &[kind_label(&self.spec.name)]);
                true
            }
            Err(e) => {
                error!(kind = %self.spec.name, worker, error = %e, "failed to start worker");
                metrics::workers_stopped().add(
                    1,
                    &[kind_label(&self.spec.name), KeyValue::new("reason", "spawn_failed")],
                );
                false
            }
        }
    }

    fn launch(self: &Arc<Self>, slot: WorkerSlot) -> std::io::Result<()> {
        let pool = Arc::clone(self);
        let span = start_worker_span(&self.spec.name, slot.worker);
        if self.spec.dedicated_thread {
            let runtime = self.runtime.clone();
            std::thread::Builder::new()
                .name(format!("fnqueue-{}", self.spec.name))
                .spawn(move || runtime.block_on(pool.run_worker(slot).instrument(span)))?;
        } else {
            self.runtime.spawn(pool.run_worker(slot).instrument(span));
        }
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, slot: WorkerSlot) {
        debug!(kind = %self.spec.name, worker = slot.worker, "worker started");

        let reason = match AssertUnwindSafe(self.work_loop(&slot)).catch_unwind().await {
            Ok(exit) => exit.reason(),
            Err(panic) => {
                let cause = anyhow::anyhow!("worker loop panicked: {}", panic_message(&*panic));
                self.report_fatal(&slot, cause);
                "fatal"
            }
        };

        debug!(kind = %self.spec.name, worker = slot.worker, reason, "worker stopped");
        drop(slot);
        metrics::workers_stopped().add(
            1,
            &[kind_label(&self.spec.name), KeyValue::new("reason", reason)],
        );
    }

    async fn work_loop(&self, slot: &WorkerSlot) -> Exit {
        let exit = loop {
            if self.cancel.is_cancelled() {
                break Exit::Cancelled;
            }
            let work = match self.dequeue().await {
                Some(work) => work,
                None => match self.retire_or_claim(slot) {
                    Some(work) => work,
                    None if self.cancel.is_cancelled() => break Exit::Cancelled,
                    None => break Exit::Idle,
                },
            };
            self.run_item(slot, work).await;
        };
        if exit == Exit::Cancelled {
            self.cancel_queued();
        }
        exit
    }

    /// Finish every queued item with [`Error::Cancelled`] without running it.
    fn cancel_queued(&self) -> usize {
        let mut cancelled = 0;
        while let Some(mut work) = self.queue.pop() {
            work.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            warn!(kind = %self.spec.name, cancelled, "queued work cancelled by disposal");
            metrics::work_finished().add(
                cancelled as u64,
                &[kind_label(&self.spec.name), KeyValue::new("outcome", "cancelled")],
            );
        }
        cancelled
    }

    /// Wait up to one poll timeout for an item. Returns `None` on timeout or
    /// cancellation.
    async fn dequeue(&self) -> Option<PendingWork> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if let Some(work) = self.queue.pop() {
                return Some(work);
            }
            let notified = self.available.notified();
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                woke = tokio::time::timeout_at(deadline, notified) => {
                    if woke.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Retire this worker, unless work arrived after the dequeue timed out,
    /// in which case the worker claims it and keeps running.
    fn retire_or_claim(&self, slot: &WorkerSlot) -> Option<PendingWork> {
        let mut active = self.active.lock();
        if !self.cancel.is_cancelled() {
            if let Some(work) = self.queue.pop() {
                debug!(
                    kind = %self.spec.name,
                    worker = slot.worker,
                    work_id = %work.id(),
                    "claimed late arrival instead of retiring"
                );
                return Some(work);
            }
        }
        slot.release_locked(&mut active);
        None
    }

    async fn run_item(&self, slot: &WorkerSlot, mut work: PendingWork) {
        let kind = &self.spec.name;
        let work_id = work.id();
        let span = start_work_span(kind, &work_id);

        let waited_ms = (Utc::now() - work.submitted_at()).num_milliseconds().max(0) as f64;
        metrics::queue_wait_ms().record(waited_ms, &[kind_label(kind)]);

        let Some(action) = work.begin() else {
            warn!(kind = %kind, work_id = %work_id, state = %work.state(), "dequeued item was not waiting, skipping");
            return;
        };
        record_state_transition(&span, WorkState::Waiting, WorkState::Processing);
        *slot.current.lock() = Some(work);

        let outcome = match AssertUnwindSafe(action(self.cancel.clone()).instrument(span.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("work panicked: {}", panic_message(&*panic))),
        };

        let Some(mut work) = slot.current.lock().take() else {
            return;
        };
        record_state_transition(&span, WorkState::Processing, WorkState::Finished);
        let label = match &outcome {
            Ok(()) => "ok",
            Err(e) => {
                let error = format!("{e:#}");
                warn!(parent: &span, kind = %kind, work_id = %work_id, %error, "work failed");
                "failed"
            }
        };
        metrics::work_finished().add(1, &[kind_label(kind), KeyValue::new("outcome", label)]);
        work.finish(outcome);
    }

    fn report_fatal(&self, slot: &WorkerSlot, cause: anyhow::Error) {
        let error = format!("{cause:#}");
        error!(
            kind = %self.spec.name,
            worker = slot.worker,
            %error,
            "worker loop failed, releasing its slot"
        );
        metrics::work_finished().add(
            1,
            &[kind_label(&self.spec.name), KeyValue::new("outcome", "fatal")],
        );
        let last = slot.current.lock().take();
        let reported = match last {
            Some(mut work) => work.fail_fatal(cause),
            None => false,
        };
        if !reported {
            warn!(
                kind = %self.spec.name,
                worker = slot.worker,
                "no unreported item left to receive the worker failure"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
