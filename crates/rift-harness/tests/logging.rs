//! Subscriber installation touches process-global state, so these tests live
//! in their own binary, away from tests that capture logs.

use rift_harness::config::{LogFormat, LoggingConfig};
use rift_harness::logging::init_tracing;
use serial_test::serial;

#[test]
#[serial]
fn test_init_is_idempotent() {
    let config = LoggingConfig::default();
    init_tracing(&config).unwrap();
    init_tracing(&config).unwrap();

    let json = LoggingConfig {
        format: LogFormat::Json,
        ..LoggingConfig::default()
    };
    init_tracing(&json).unwrap();
    tracing::info!("still logging after repeated init");
}

#[test]
#[serial]
fn test_invalid_filter_is_reported() {
    if std::env::var("RUST_LOG").is_ok() {
        return;
    }
    let config = LoggingConfig {
        filter: "rift_harness=verbose".to_string(),
        ..LoggingConfig::default()
    };
    assert!(init_tracing(&config).is_err());
}
