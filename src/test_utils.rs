//! Test utilities for Stepline.
//!
//! Shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Runtime-driving helpers and settlement assertions
//!
//! # Example
//! ```
//! use stepline::test_utils::init_test_logging;
//! use stepline::{Runtime, StepOutcome};
//!
//! init_test_logging();
//! let mut rt = Runtime::deterministic();
//! rt.task(|cx| {
//!     cx.step(|_, _| StepOutcome::ok(1));
//! });
//! rt.run();
//! ```

use std::sync::{Mutex, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that mutate env vars.
pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Log a test phase banner.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that a settlement is Ok with a specific value.
#[macro_export]
macro_rules! assert_settled_ok {
    ($settlement:expr, $expected:expr) => {
        match $settlement {
            Some(Ok(v)) => assert_eq!(v, $crate::Value::from($expected)),
            other => unreachable!("expected Ok({:?}), got {:?}", $expected, other),
        }
    };
}

/// Assert that a settlement is an error of the given kind.
#[macro_export]
macro_rules! assert_settled_err {
    ($settlement:expr, $kind:expr) => {
        match $settlement {
            Some(Err(e)) => assert_eq!(e.kind(), $kind),
            other => unreachable!("expected Err({:?}), got {:?}", $kind, other),
        }
    };
}
