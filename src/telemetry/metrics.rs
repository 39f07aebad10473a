//! Metric instrument factories for fnqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"fnqueue"` meter; without an
//! installed provider they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for fnqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("fnqueue")
}

/// Counter: work items enqueued.
/// Labels: `kind`.
pub fn work_submitted() -> Counter<u64> {
    meter()
        .u64_counter("fnqueue.work.submitted")
        .with_description("Number of work items enqueued")
        .build()
}

/// Counter: work items that reached `finished`.
/// Labels: `kind`, `outcome` ("ok" | "failed" | "fatal" | "cancelled").
pub fn work_finished() -> Counter<u64> {
    meter()
        .u64_counter("fnqueue.work.finished")
        .with_description("Number of work items finished")
        .build()
}

/// Counter: worker loops started.
/// Labels: `kind`.
pub fn workers_started() -> Counter<u64> {
    meter()
        .u64_counter("fnqueue.workers.started")
        .with_description("Number of worker loops started")
        .build()
}

/// Counter: worker loops that exited.
/// Labels: `kind`, `reason` ("idle" | "cancelled" | "fatal" | "spawn_failed").
pub fn workers_stopped() -> Counter<u64> {
    meter()
        .u64_counter("fnqueue.workers.stopped")
        .with_description("Number of worker loops that exited")
        .build()
}

/// Histogram: time between enqueue and a worker picking the item up.
/// Labels: `kind`.
pub fn queue_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("fnqueue.work.queue_wait_ms")
        .with_description("Time spent waiting in the queue")
        .with_unit("ms")
        .build()
}

/// Counter: items handed to a fan-out.
/// Labels: `mode` ("direct" | "queued" | "batch").
pub fn fanout_items() -> Counter<u64> {
    meter()
        .u64_counter("fnqueue.fanout.items")
        .with_description("Number of items processed by fan-out helpers")
        .build()
}

pub(crate) fn kind_label(kind: &str) -> KeyValue {
    KeyValue::new("kind", kind.to_string())
}
