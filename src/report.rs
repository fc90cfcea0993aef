//! Error reporting seam for the cron engine.
//!
//! The engine never retries a poisoned task, so the single report emitted
//! here is the only trace an operator gets. The trait exists so tests can
//! record reports instead of logging them.

use tracing::error;

pub trait ErrorReporter: Send + Sync {
    /// Report a non-recoverable condition. `source` identifies the task or
    /// subsystem that produced it.
    fn report(&self, message: &str, category: &str, source: Option<&str>);
}

/// Default reporter; forwards to the tracing error stream.
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, message: &str, category: &str, source: Option<&str>) {
        match source {
            Some(source) => error!(category, source, "{}", message),
            None => error!(category, "{}", message),
        }
    }
}
