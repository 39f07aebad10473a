//! Error types for fnqueue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A submitted action returned an error or panicked.
    #[error("work failed: {0:#}")]
    Work(anyhow::Error),

    /// The worker loop itself failed, not a single item's action.
    #[error("queue worker failed and cannot continue: {0:#}")]
    Fatal(anyhow::Error),

    /// The service was disposed while the awaited work was still waiting.
    #[error("work cancelled before it started")]
    Cancelled,

    #[error("batch of {size} items returned with {remaining} left unsignalled")]
    BatchUnderflow { size: usize, remaining: usize },

    #[error("invalid latch operation: {0}")]
    InvalidLatch(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The error the user action produced, if this is a work failure.
    pub fn work_error(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Work(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
