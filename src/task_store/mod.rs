//! Durable task store for the cron engine.
//!
//! Delivery is at-least-once: a worker that is merely slow (not dead) keeps
//! running its task after the claim threshold passes, at which point another
//! worker may re-claim and re-run it. Handlers are expected to tolerate the
//! occasional duplicate.

mod models;
mod schema;
mod sqlite_task_store;

pub use models::*;
pub use schema::CRON_VERSIONED_SCHEMAS;
pub use sqlite_task_store::SqliteTaskStore;

use anyhow::Result;

pub trait TaskStore: Send + Sync {
    // Background task queue
    /// Enqueue a task. Returns the new task id.
    fn insert_task(&self, handler_name: &str, payload: &serde_json::Value) -> Result<i64>;
    /// Claim one unclaimed (or abandoned) task. The claim is a conditional
    /// update keyed on the previously read `claimed_at`; a lost race retries
    /// the search a bounded number of times before giving up with `None`.
    fn claim_one(&self, claim_threshold: i64, now: i64) -> Result<Option<TaskRecord>>;
    /// Delete a task. Idempotent; deleting a missing id is not an error.
    fn remove_task(&self, task_id: i64) -> Result<()>;
    fn pending_task_count(&self) -> Result<usize>;

    // Scheduled task registry
    fn get_scheduled_task(&self, task_id: i64) -> Result<Option<ScheduledTaskDef>>;
    fn get_scheduled_task_by_name(&self, name: &str) -> Result<Option<ScheduledTaskDef>>;
    fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTaskDef>>;
    /// Enabled tasks with `next_time <= now`.
    fn due_scheduled_tasks(&self, now: i64) -> Result<Vec<ScheduledTaskDef>>;
    /// Install or update a definition by name. An existing row keeps its
    /// `next_time` and `disabled` state; only the recurrence fields change.
    fn upsert_scheduled_task(&self, def: &ScheduledTaskDef) -> Result<i64>;
    fn set_disabled(&self, task_id: i64, disabled: bool) -> Result<()>;
    /// Conditionally advance `next_time` from `old` to `new`. Returns false
    /// when the row has already moved on (another worker promoted it first).
    fn advance_next_time(&self, task_id: i64, old: i64, new: i64) -> Result<bool>;
    /// Advance `next_time` to `new` only if that is later than the stored
    /// value. Used after a run completes; never regresses the schedule.
    fn raise_next_time(&self, task_id: i64, new: i64) -> Result<()>;
    /// Unconditionally overwrite `next_time`. Admin recompute path only.
    fn force_next_time(&self, task_id: i64, value: i64) -> Result<()>;

    // Run log
    fn append_run_log(&self, task_id: i64, ran_at: i64, duration: f64) -> Result<i64>;
    fn run_log_for_task(&self, task_id: i64, limit: usize) -> Result<Vec<TaskRunLogEntry>>;
    /// Delete run-log entries older than the given timestamp.
    fn prune_run_log(&self, before_timestamp: i64) -> Result<usize>;

    // Global next-fire cache
    fn next_task_time(&self) -> Result<Option<i64>>;
    fn set_next_task_time(&self, value: i64) -> Result<()>;
}
