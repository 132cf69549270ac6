//! Tracing and logging setup shared by binaries and tests.

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging for tests (captured per test, compact format).
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Subscriber configuration (filters, formats).
pub mod tracing;
