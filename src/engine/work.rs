//! Pending work: one submitted action plus its completion contract.
//!
//! A [`PendingWork`] is owned by its pool's queue until a worker dequeues
//! it, then by that worker until it finishes. Completion is reported through
//! a [`Notifier`]: either a failure callback (fire-and-forget) or a oneshot
//! channel behind an awaitable [`Completion`].

use crate::error::{Error, Result};
use crate::model::{WorkId, WorkState};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Future returned by a work action.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A type-erased work action. Receives the service's cancellation token.
pub type Action = Box<dyn FnOnce(CancellationToken) -> WorkFuture + Send>;

/// Called at most once with the failure of a fire-and-forget item.
pub type FailureHandler = Box<dyn FnOnce(Error) + Send>;

/// Shared, observable state of one item.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(WorkState::Waiting.as_u8()))
    }

    pub(crate) fn get(&self) -> WorkState {
        WorkState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the transition is legal. Returns the previous state.
    fn advance(&self, to: WorkState) -> Option<WorkState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                WorkState::from_u8(cur)
                    .can_transition_to(to)
                    .then_some(to.as_u8())
            })
            .ok()
            .map(WorkState::from_u8)
    }
}

/// How an item reports its outcome.
pub enum Notifier {
    /// Fire-and-forget: the handler sees failures only, success is silent.
    Callback(FailureHandler),
    /// Awaitable: the outcome is sent to a [`Completion`].
    Awaitable(oneshot::Sender<Result<()>>),
}

impl Notifier {
    /// Deliver the action's outcome.
    pub(crate) fn notify(self, outcome: anyhow::Result<()>) {
        self.deliver(outcome.map_err(Error::Work));
    }

    /// Deliver a failure of the worker loop itself.
    pub(crate) fn fatal(self, cause: anyhow::Error) {
        self.deliver(Err(Error::Fatal(cause)));
    }

    fn deliver(self, outcome: Result<()>) {
        match (self, outcome) {
            (Notifier::Callback(_), Ok(())) => {}
            (Notifier::Callback(handler), Err(e)) => handler(e),
            (Notifier::Awaitable(tx), outcome) => {
                // The receiver may have given up after cancellation.
                let _ = tx.send(outcome);
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notifier::Callback(_) => f.write_str("Notifier::Callback"),
            Notifier::Awaitable(_) => f.write_str("Notifier::Awaitable"),
        }
    }
}

/// One submitted unit of work.
pub struct PendingWork {
    id: WorkId,
    submitted_at: DateTime<Utc>,
    state: Arc<StateCell>,
    action: Option<Action>,
    notifier: Option<Notifier>,
}

impl PendingWork {
    /// Fire-and-forget item: `on_failure` runs if the action fails.
    pub fn with_callback(action: Action, on_failure: FailureHandler) -> Self {
        Self::new(action, Notifier::Callback(on_failure))
    }

    /// Awaitable item. The returned [`Completion`] gives up with
    /// [`Error::Cancelled`] if `cancel` fires while the item is still waiting.
    pub fn awaitable(action: Action, cancel: CancellationToken) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let work = Self::new(action, Notifier::Awaitable(tx));
        let completion = Completion {
            id: work.id,
            submitted_at: work.submitted_at,
            state: Arc::clone(&work.state),
            rx,
            cancel,
        };
        (work, completion)
    }

    fn new(action: Action, notifier: Notifier) -> Self {
        Self {
            id: WorkId::new(),
            submitted_at: Utc::now(),
            state: Arc::new(StateCell::new()),
            action: Some(action),
            notifier: Some(notifier),
        }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn state(&self) -> WorkState {
        self.state.get()
    }

    /// Waiting -> Processing. Hands out the action exactly once.
    pub(crate) fn begin(&mut self) -> Option<Action> {
        self.state.advance(WorkState::Processing)?;
        self.action.take()
    }

    /// Mark finished and report the outcome. No-op if already reported.
    pub(crate) fn finish(&mut self, outcome: anyhow::Result<()>) {
        self.state.advance(WorkState::Finished);
        if let Some(notifier) = self.notifier.take() {
            notifier.notify(outcome);
        }
    }

    /// Mark finished without running and report [`Error::Cancelled`].
    pub(crate) fn cancel(&mut self) {
        self.state.advance(WorkState::Finished);
        self.action = None;
        if let Some(notifier) = self.notifier.take() {
            notifier.deliver(Err(Error::Cancelled));
        }
    }

    /// Mark finished and report a worker-loop failure. Returns `false` if the
    /// notifier was already consumed.
    pub(crate) fn fail_fatal(&mut self, cause: anyhow::Error) -> bool {
        self.state.advance(WorkState::Finished);
        match self.notifier.take() {
            Some(notifier) => {
                notifier.fatal(cause);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for PendingWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWork")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("notifier", &self.notifier)
            .finish()
    }
}

/// Awaitable handle for an item submitted with `submit_awaitable`.
///
/// Cancellation is cooperative. If the service is disposed while the item
/// is still waiting, this handle fails with [`Error::Cancelled`], but the
/// item is not withdrawn: a worker that already dequeued it still runs it.
/// Once the item is processing, the handle waits for it to finish even after
/// disposal.
#[derive(Debug)]
pub struct Completion {
    id: WorkId,
    submitted_at: DateTime<Utc>,
    state: Arc<StateCell>,
    rx: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
}

impl Completion {
    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn state(&self) -> WorkState {
        self.state.get()
    }

    /// Wait for the item to finish.
    pub async fn wait(self) -> Result<()> {
        let Completion {
            state,
            mut rx,
            cancel,
            ..
        } = self;
        let mut watch_cancel = true;
        loop {
            tokio::select! {
                biased;
                outcome = &mut rx => {
                    return outcome.unwrap_or_else(|_| {
                        Err(Error::Fatal(anyhow::anyhow!(
                            "worker exited without reporting an outcome"
                        )))
                    });
                }
                _ = cancel.cancelled(), if watch_cancel => {
                    if state.get() == WorkState::Waiting {
                        return Err(Error::Cancelled);
                    }
                    watch_cancel = false;
                }
            }
        }
    }
}

impl IntoFuture for Completion {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pool::boxed;
    use std::sync::Mutex;

    fn noop() -> Action {
        boxed(|_token| async { Ok(()) })
    }

    #[test]
    fn action_is_handed_out_once() {
        let mut work = PendingWork::with_callback(noop(), Box::new(|_| {}));
        assert_eq!(work.state(), WorkState::Waiting);
        assert!(work.begin().is_some());
        assert_eq!(work.state(), WorkState::Processing);
        assert!(work.begin().is_none());
    }

    #[test]
    fn callback_sees_failures_only_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut work = PendingWork::with_callback(
            noop(),
            Box::new(move |e| sink.lock().unwrap().push(e.to_string())),
        );
        work.begin();
        work.finish(Err(anyhow::anyhow!("first")));
        work.finish(Err(anyhow::anyhow!("second")));
        assert!(!work.fail_fatal(anyhow::anyhow!("third")));

        assert_eq!(work.state(), WorkState::Finished);
        assert_eq!(*seen.lock().unwrap(), vec!["work failed: first".to_string()]);
    }

    #[test]
    fn callback_is_silent_on_success() {
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let mut work =
            PendingWork::with_callback(noop(), Box::new(move |_| *flag.lock().unwrap() = true));
        work.begin();
        work.finish(Ok(()));
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn fatal_failure_reaches_awaitable_handle() {
        let (mut work, completion) = PendingWork::awaitable(noop(), CancellationToken::new());
        assert_eq!(completion.id(), work.id());
        work.begin();
        assert!(work.fail_fatal(anyhow::anyhow!("loop died")));

        let err = completion.await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn cancelled_item_reports_once_and_never_runs() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut work = PendingWork::with_callback(
            noop(),
            Box::new(move |e| sink.lock().unwrap().push(matches!(e, Error::Cancelled))),
        );
        work.cancel();
        assert!(work.state().is_terminal());
        assert!(work.begin().is_none());
        work.finish(Err(anyhow::anyhow!("late")));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn dropped_item_fails_its_handle() {
        let (work, completion) = PendingWork::awaitable(noop(), CancellationToken::new());
        drop(work);
        assert!(matches!(completion.await, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn cancellation_only_abandons_waiting_items() {
        let cancel = CancellationToken::new();
        let (mut work, completion) = PendingWork::awaitable(noop(), cancel.clone());
        work.begin();
        cancel.cancel();

        let waiter = tokio::spawn(completion.wait());
        tokio::task::yield_now().await;
        work.finish(Ok(()));
        waiter.await.unwrap().unwrap();
    }
}
