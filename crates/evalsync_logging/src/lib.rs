#![deny(missing_docs)]
//! Shared logging utilities for the evalsync workspace.
//!
//! This crate provides the `sync_*` logging macros used across the codebase,
//! the logical clock that stamps every line, and a minimal test initializer
//! for the global logger.

use std::cell::Cell;

thread_local! {
    /// Logical time (milliseconds since the runtime started) of the message
    /// currently being dispatched on this thread.
    static LOGICAL_TIME_MS: Cell<u64> = const { Cell::new(0) };
}

/// Sets the logical time for the current thread.
/// The runtime calls this once per dispatched message.
pub fn set_logical_time(ms: u64) {
    LOGICAL_TIME_MS.with(|v| v.set(ms));
}

/// Retrieves the logical time for the current thread.
/// Returns 0 outside of a dispatch loop.
pub fn logical_time() -> u64 {
    LOGICAL_TIME_MS.with(|v| v.get())
}

/// Logs a trace-level message stamped with the logical time.
#[macro_export]
macro_rules! sync_trace {
    ($($arg:tt)*) => {{
        log::trace!("[t={}] {}", $crate::logical_time(), format_args!($($arg)*));
    }};
}

/// Logs a debug-level message stamped with the logical time.
#[macro_export]
macro_rules! sync_debug {
    ($($arg:tt)*) => {{
        log::debug!("[t={}] {}", $crate::logical_time(), format_args!($($arg)*));
    }};
}

/// Logs an info-level message stamped with the logical time.
#[macro_export]
macro_rules! sync_info {
    ($($arg:tt)*) => {{
        log::info!("[t={}] {}", $crate::logical_time(), format_args!($($arg)*));
    }};
}

/// Logs a warn-level message stamped with the logical time.
#[macro_export]
macro_rules! sync_warn {
    ($($arg:tt)*) => {{
        log::warn!("[t={}] {}", $crate::logical_time(), format_args!($($arg)*));
    }};
}

/// Logs an error-level message stamped with the logical time.
#[macro_export]
macro_rules! sync_error {
    ($($arg:tt)*) => {{
        log::error!("[t={}] {}", $crate::logical_time(), format_args!($($arg)*));
    }};
}

/// Initializes a simple terminal logger for use in tests.
///
/// This safely no-ops if another logger has already been initialized.
pub fn initialize_for_tests() {
    use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};

    // Trace in debug builds so dropped frames show up in failing test output.
    let level = if cfg!(debug_assertions) {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };

    // Ignore the error if a logger was already set by another test.
    let _ = CombinedLogger::init(vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )]);
}
