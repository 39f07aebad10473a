//! Queue engine: pending work, per-kind worker pools, and the service that owns them.

pub mod pool;
pub mod service;
pub mod work;

pub use pool::WorkerPool;
pub use service::QueueService;
pub use work::{Completion, PendingWork};
