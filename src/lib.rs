//! Forum Cron Library
//!
//! Background task queue and scheduled-trigger engine for the forum server.
//! This library exposes the internal modules for testing and potential reuse.

pub mod config;
pub mod dispatch;
pub mod mail;
pub mod report;
pub mod runner;
pub mod server;
pub mod sqlite_persistence;
pub mod task_store;
pub mod tasks;
pub mod trigger;

// Re-export commonly used types for convenience
pub use dispatch::{BackgroundHandler, Dispatcher, HandlerRegistry, ScheduledHandler, TaskError};
pub use mail::{MailQueue, NullMailQueue};
pub use report::{ErrorReporter, TracingErrorReporter};
pub use runner::{RunSummary, TaskRunner, TimeBudget};
pub use task_store::{SqliteTaskStore, TaskStore};
