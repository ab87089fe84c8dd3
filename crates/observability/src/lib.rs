//! Tracing/logging setup shared by binaries and tests.

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize process-wide tracing from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() -> bool {
    tracing::init(&TracingConfig::from_env())
}

/// Human-readable output captured by the test harness.
pub fn init_for_tests() -> bool {
    tracing::init(&TracingConfig {
        format: LogFormat::Text,
        test_writer: true,
        ..TracingConfig::default()
    })
}
