//! # fnqueue
//!
//! Typed, in-process work queues. Work is submitted under a queue kind, and
//! each kind runs on its own lazily started pool with an independent worker
//! limit. Workers retire when idle.
//!
//! Provides fire-and-forget and awaitable submission (`engine`), progress
//! latches (`latch`), whole-collection fan-out with progress ticks
//! (`fanout`), and tracing / OpenTelemetry setup (`telemetry`).

pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod kind;
pub mod latch;
pub mod model;
pub mod telemetry;

pub use engine::{Completion, QueueService, WorkerPool};
pub use error::{Error, Result};
pub use fanout::FanOut;
pub use kind::{KindSpec, QueueKind};
pub use latch::{ProgressLatch, SubLatch};
