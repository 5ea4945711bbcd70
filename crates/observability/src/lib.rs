//! Tracing/logging setup shared by every tidepool binary.

/// Initialize process-wide tracing from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output formats).
pub mod tracing;

pub use self::tracing::{LogFormat, init_with};
