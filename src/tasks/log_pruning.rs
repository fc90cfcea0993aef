//! Run-log pruning scheduled task.
//!
//! Deletes old entries from the scheduled task run log based on the
//! configured retention period.

use crate::dispatch::{BackgroundHandler, ScheduledHandler, TaskContext, TaskError};
use crate::task_store::{TimeUnit, DEFAULT_LOG_RETENTION_DAYS};
use tracing::info;

/// Scheduled task that prunes old run-log entries.
///
/// Runs daily and deletes entries older than the retention period.
pub struct LogPruningTask {
    retention_days: i64,
}

impl LogPruningTask {
    pub fn new(retention_days: i64) -> Self {
        Self { retention_days }
    }
}

impl Default for LogPruningTask {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RETENTION_DAYS)
    }
}

impl BackgroundHandler for LogPruningTask {
    fn name(&self) -> &'static str {
        "log_pruning"
    }

    fn description(&self) -> &'static str {
        "Delete old run-log entries based on retention policy"
    }

    fn execute(&self, ctx: &TaskContext, _payload: &serde_json::Value) -> Result<(), TaskError> {
        let cutoff = ctx.now - self.retention_days * 24 * 60 * 60;

        let deleted = ctx
            .store
            .prune_run_log(cutoff)
            .map_err(|e| TaskError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!(
                "Pruned {} run-log entries older than {} days",
                deleted, self.retention_days
            );
        }

        Ok(())
    }
}

impl ScheduledHandler for LogPruningTask {
    fn default_recurrence(&self) -> (i64, TimeUnit, i64) {
        // Daily at 03:30 UTC, away from the usual midnight crowd
        (1, TimeUnit::Day, 3 * 60 * 60 + 30 * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::{SqliteTaskStore, TaskStore};
    use std::sync::Arc;

    #[test]
    fn test_prunes_only_entries_past_retention() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let now = 100 * 24 * 60 * 60;

        // One entry well past retention, one recent
        store.append_run_log(1, now - 40 * 24 * 60 * 60, 0.1).unwrap();
        store.append_run_log(1, now - 60 * 60, 0.1).unwrap();

        let task = LogPruningTask::new(30);
        let ctx = TaskContext {
            store: store.clone(),
            now,
        };
        task.execute(&ctx, &serde_json::json!({})).unwrap();

        let remaining = store.run_log_for_task(1, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ran_at, now - 60 * 60);
    }

    #[test]
    fn test_noop_on_empty_log() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let task = LogPruningTask::default();
        let ctx = TaskContext {
            store: store.clone(),
            now: 1_000_000,
        };
        task.execute(&ctx, &serde_json::json!({})).unwrap();
    }
}
