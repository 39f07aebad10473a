//! Progress ticker and first-failure capture for fan-out operations.

use crate::error::{Error, Result};
use crate::latch::ProgressLatch;
use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Holds the first failure reported by any item of a fan-out.
///
/// Later failures are dropped; only the first one is raised.
#[derive(Debug, Default)]
pub struct FirstFailure {
    slot: Mutex<FailureSlot>,
}

#[derive(Debug, Default)]
struct FailureSlot {
    seen: bool,
    error: Option<Error>,
}

impl FirstFailure {
    /// Record a failure. Returns `true` if it was the first.
    pub fn record(&self, error: Error) -> bool {
        let mut slot = self.slot.lock();
        if slot.seen {
            return false;
        }
        slot.seen = true;
        slot.error = Some(error);
        true
    }

    /// Has any failure been recorded, raised or not?
    pub fn is_failed(&self) -> bool {
        self.slot.lock().seen
    }

    /// Take the recorded failure so it can be raised. Yields it at most once.
    pub fn take(&self) -> Option<Error> {
        self.slot.lock().error.take()
    }
}

/// Calls a progress callback at a fixed interval until a latch reaches zero.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    interval: Duration,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tick until `latch` reaches zero.
    ///
    /// Before each tick a recorded failure is raised, and a fired `cancel`
    /// ends the run with [`Error::Cancelled`]. The sleep between ticks is cut
    /// short as soon as the latch reaches zero.
    pub async fn run<P>(
        &self,
        latch: &ProgressLatch,
        failures: &FirstFailure,
        cancel: &CancellationToken,
        mut on_tick: P,
    ) -> Result<()>
    where
        P: FnMut(&ProgressLatch) -> anyhow::Result<()>,
    {
        loop {
            if let Some(e) = failures.take() {
                return Err(e);
            }
            if latch.is_set() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            on_tick(latch).map_err(|e| Error::Work(e.context("progress callback failed")))?;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = latch.wait() => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}
