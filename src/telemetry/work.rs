//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for items flowing
//! through a worker pool.

use tracing::Span;

use crate::model::{WorkId, WorkState};

/// Start a span for one item's execution.
///
/// The `work.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_work_span(kind: &str, work_id: &WorkId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.kind" = kind,
        "work.id" = %work_id.0,
        "work.state" = tracing::field::Empty,
    )
}

/// Start a span covering one worker loop's lifetime.
pub fn start_worker_span(kind: &str, worker: u64) -> Span {
    tracing::debug_span!("queue.worker", "queue.kind" = kind, "queue.worker" = worker)
}

/// Record a state transition on the given span.
///
/// Emits a tracing `debug` event scoped to the span and updates `work.state`.
pub fn record_state_transition(span: &Span, from: WorkState, to: WorkState) {
    span.record("work.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(%from, %to, "state_transition");
    });
}
