//! Built-in task handlers and registry seeding.

mod log_pruning;

pub use log_pruning::LogPruningTask;

use crate::dispatch::HandlerRegistry;
use crate::task_store::{ScheduledTaskDef, TaskStore};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Registry with every built-in handler installed.
pub fn default_registry(log_retention_days: i64) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_scheduled(Arc::new(LogPruningTask::new(log_retention_days)));
    registry
}

/// Install a registry row for every scheduled handler that does not have one
/// yet. Existing rows keep their schedule state; only the recurrence fields
/// are refreshed. Returns the number of handlers seeded.
pub fn seed_scheduled_tasks(store: &dyn TaskStore, registry: &HandlerRegistry) -> Result<usize> {
    let mut seeded = 0;
    for handler in registry.scheduled_handlers() {
        let (regularity, unit, offset) = handler.default_recurrence();
        store.upsert_scheduled_task(&ScheduledTaskDef {
            id: 0,
            name: handler.name().to_string(),
            next_time: 0,
            time_offset: offset,
            time_regularity: regularity,
            time_unit: unit,
            disabled: false,
        })?;
        info!("Seeded scheduled task '{}'", handler.name());
        seeded += 1;
    }
    Ok(seeded)
}
