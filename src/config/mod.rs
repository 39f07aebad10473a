//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every variable is optional, but a value that is
//! present and malformed fails fast rather than falling back to a default.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Timing knobs for the queue service and fan-out helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// How long an idle worker waits for new work before retiring.
    pub poll_timeout: Duration,
    /// Interval between progress ticks during a fan-out.
    pub tick_interval: Duration,
    /// Pause between consecutive batches so the ticker gets scheduled.
    pub batch_yield: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            tick_interval: Duration::from_millis(100),
            batch_yield: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    /// Directory of `*.toml` queue kind declarations.
    pub kinds_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = ServiceConfig::default();
        Ok(Self {
            service: ServiceConfig {
                poll_timeout: duration_var("FNQUEUE_POLL_TIMEOUT_MS", defaults.poll_timeout)?,
                tick_interval: duration_var("FNQUEUE_TICK_INTERVAL_MS", defaults.tick_interval)?,
                batch_yield: duration_var("FNQUEUE_BATCH_YIELD_MS", defaults.batch_yield)?,
            },
            kinds_dir: std::env::var("FNQUEUE_KINDS_DIR").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn duration_var(name: &str, default: Duration) -> Result<Duration> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    let ms: u64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a whole number of milliseconds, got {raw:?}")))?;
    if ms == 0 {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(Duration::from_millis(ms))
}
