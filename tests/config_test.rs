use fnqueue::config::{Config, ServiceConfig};
use std::time::Duration;

// Environment variables are process-global, so every case lives in one test.
#[test]
fn config_from_env_reads_overrides_and_rejects_bad_values() {
    unsafe {
        std::env::remove_var("FNQUEUE_POLL_TIMEOUT_MS");
        std::env::remove_var("FNQUEUE_TICK_INTERVAL_MS");
        std::env::remove_var("FNQUEUE_BATCH_YIELD_MS");
        std::env::remove_var("FNQUEUE_KINDS_DIR");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.service, ServiceConfig::default());
    assert!(config.kinds_dir.is_none());
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("FNQUEUE_POLL_TIMEOUT_MS", "250");
        std::env::set_var("FNQUEUE_TICK_INTERVAL_MS", " 20 ");
        std::env::set_var("FNQUEUE_KINDS_DIR", "/etc/fnqueue/kinds");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.service.poll_timeout, Duration::from_millis(250));
    assert_eq!(config.service.tick_interval, Duration::from_millis(20));
    assert_eq!(config.service.batch_yield, Duration::from_millis(1));
    assert_eq!(
        config.kinds_dir.as_deref(),
        Some(std::path::Path::new("/etc/fnqueue/kinds"))
    );

    unsafe {
        std::env::set_var("FNQUEUE_POLL_TIMEOUT_MS", "soon");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("FNQUEUE_POLL_TIMEOUT_MS", "0");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("FNQUEUE_POLL_TIMEOUT_MS");
        std::env::remove_var("FNQUEUE_TICK_INTERVAL_MS");
        std::env::remove_var("FNQUEUE_KINDS_DIR");
    }
}
