//! Progress latches: decrementing counters of outstanding work.
//!
//! A [`ProgressLatch`] starts at some count and is signalled down to zero as
//! work completes. A [`SubLatch`] tracks one slice of a larger job: every
//! change it makes is applied to its parent as well, so the parent always
//! reflects the sum of its slices.
//!
//! Going below zero, or adding to a latch that already reached zero, is a
//! programming error and fails loudly instead of clamping.

use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
pub(crate) struct Counts {
    initial: usize,
    current: usize,
}

impl Counts {
    fn check_signal(&self, n: usize) -> Result<()> {
        if self.current < n {
            return Err(Error::InvalidLatch(format!(
                "cannot signal {n} with only {} remaining",
                self.current
            )));
        }
        Ok(())
    }

    fn can_add(&self, n: usize) -> bool {
        self.current != 0 && self.current.checked_add(n).is_some()
    }
}

/// A countdown of outstanding work items.
#[derive(Debug)]
pub struct ProgressLatch {
    counts: Mutex<Counts>,
    zeroed: Notify,
}

impl ProgressLatch {
    pub fn new(initial: usize) -> Self {
        Self {
            counts: Mutex::new(Counts {
                initial,
                current: initial,
            }),
            zeroed: Notify::new(),
        }
    }

    /// Count the latch was created (or last reset) with.
    pub fn initial(&self) -> usize {
        self.counts.lock().initial
    }

    /// Remaining count.
    pub fn current(&self) -> usize {
        self.counts.lock().current
    }

    /// Has the latch reached zero?
    pub fn is_set(&self) -> bool {
        self.current() == 0
    }

    /// Decrement by one. Returns `true` if this call reached zero.
    pub fn signal(&self) -> Result<bool> {
        self.signal_n(1)
    }

    /// Decrement by `n`. Fails without changing anything if fewer than `n` remain.
    pub fn signal_n(&self, n: usize) -> Result<bool> {
        let mut counts = self.counts.lock();
        counts.check_signal(n)?;
        counts.current -= n;
        let reached_zero = n > 0 && counts.current == 0;
        drop(counts);
        if reached_zero {
            self.zeroed.notify_waiters();
        }
        Ok(reached_zero)
    }

    /// Increase the remaining count by `n`. Returns `false` if the latch has
    /// already reached zero.
    pub fn try_add_count(&self, n: usize) -> bool {
        let mut counts = self.counts.lock();
        if !counts.can_add(n) {
            return false;
        }
        counts.current += n;
        true
    }

    /// Like [`try_add_count`](Self::try_add_count) but a completed latch is an error.
    pub fn add_count(&self, n: usize) -> Result<()> {
        if self.try_add_count(n) {
            Ok(())
        } else {
            Err(Error::InvalidLatch(
                "cannot add to a latch that already reached zero".to_string(),
            ))
        }
    }

    /// Restore the remaining count to the initial count.
    pub fn reset(&self) -> Result<()> {
        {
            let mut counts = self.counts.lock();
            counts.current = counts.initial;
        }
        self.wake_if_zero();
        Ok(())
    }

    /// Replace both the initial and remaining count. Resetting to zero
    /// releases every waiter.
    pub fn reset_to(&self, count: usize) -> Result<()> {
        {
            let mut counts = self.counts.lock();
            counts.initial = count;
            counts.current = count;
        }
        self.wake_if_zero();
        Ok(())
    }

    /// Wait until the remaining count is zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.zeroed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock()
    }

    fn wake_if_zero(&self) {
        if self.is_set() {
            self.zeroed.notify_waiters();
        }
    }
}

/// A latch for one slice of a parent latch's work.
///
/// Both counters change together or not at all. Resetting is not supported,
/// since the parent's lifecycle is independent of any one slice.
#[derive(Debug)]
pub struct SubLatch {
    own: ProgressLatch,
    parent: Arc<ProgressLatch>,
}

impl SubLatch {
    pub fn new(parent: Arc<ProgressLatch>, initial: usize) -> Self {
        Self {
            own: ProgressLatch::new(initial),
            parent,
        }
    }

    pub fn parent(&self) -> &Arc<ProgressLatch> {
        &self.parent
    }

    pub fn initial(&self) -> usize {
        self.own.initial()
    }

    pub fn current(&self) -> usize {
        self.own.current()
    }

    pub fn is_set(&self) -> bool {
        self.own.is_set()
    }

    pub fn signal(&self) -> Result<bool> {
        self.signal_n(1)
    }

    /// Decrement self and parent by `n`. Returns `true` only if both reached zero.
    pub fn signal_n(&self, n: usize) -> Result<bool> {
        let (own_zero, parent_zero) = {
            // Lock order is always child then parent.
            let mut own = self.own.lock();
            let mut parent = self.parent.lock();
            own.check_signal(n)?;
            parent.check_signal(n).map_err(|e| match e {
                Error::InvalidLatch(msg) => Error::InvalidLatch(format!("parent latch: {msg}")),
                other => other,
            })?;
            own.current -= n;
            parent.current -= n;
            (own.current == 0, parent.current == 0)
        };
        if n > 0 {
            self.own.wake_if_zero();
            self.parent.wake_if_zero();
        }
        Ok(n > 0 && own_zero && parent_zero)
    }

    /// Increase self and parent by `n`. Returns `false`, changing neither,
    /// if either has already reached zero.
    pub fn try_add_count(&self, n: usize) -> bool {
        let mut own = self.own.lock();
        let mut parent = self.parent.lock();
        if !own.can_add(n) || !parent.can_add(n) {
            return false;
        }
        own.current += n;
        parent.current += n;
        true
    }

    pub fn add_count(&self, n: usize) -> Result<()> {
        if self.try_add_count(n) {
            Ok(())
        } else {
            Err(Error::InvalidLatch(
                "cannot add to a sub-latch or parent that already reached zero".to_string(),
            ))
        }
    }

    pub fn reset(&self) -> Result<()> {
        Err(Error::Unsupported("sub-latches cannot be reset".to_string()))
    }

    pub fn reset_to(&self, _count: usize) -> Result<()> {
        Err(Error::Unsupported("sub-latches cannot be reset".to_string()))
    }

    /// Wait until this slice's remaining count is zero.
    pub async fn wait(&self) {
        self.own.wait().await
    }
}
