//! SQLite schema definitions for the cron database.
//!
//! This module defines the schema for the background task queue, the
//! scheduled task registry, its run log, and the engine key-value state.

use crate::sqlite_column;
use crate::sqlite_persistence::versioned_schema::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Task queue, scheduled registry, run log, engine state
// =============================================================================

/// Background task queue - one row per pending unit of work
const BACKGROUND_TASKS_TABLE_V1: Table = Table {
    name: "background_tasks",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // rowid alias
        sqlite_column!("handler_name", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!(
            "claimed_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_background_tasks_claimed_at", "claimed_at")],
};

/// Scheduled task registry - recurrence definitions with next-fire times
const SCHEDULED_TASKS_TABLE_V1: Table = Table {
    name: "scheduled_tasks",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "next_time",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("time_offset", &SqlType::Integer, non_null = true),
        sqlite_column!("time_regularity", &SqlType::Integer, non_null = true),
        sqlite_column!("time_unit", &SqlType::Text, non_null = true),
        sqlite_column!(
            "disabled",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_scheduled_tasks_due", "disabled, next_time")],
};

/// Run log - append-only history of scheduled task executions
const SCHEDULED_TASK_LOG_TABLE_V1: Table = Table {
    name: "scheduled_task_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // rowid alias
        sqlite_column!("task_id", &SqlType::Integer, non_null = true),
        sqlite_column!("ran_at", &SqlType::Integer, non_null = true),
        sqlite_column!("duration", &SqlType::Real, non_null = true),
    ],
    indices: &[("idx_scheduled_task_log_task_id", "task_id")],
};

/// Engine state - key-value store; holds the global next-fire cache
const ENGINE_STATE_TABLE_V1: Table = Table {
    name: "engine_state",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// All versioned schemas for the cron database.
///
/// Version 1: task queue, scheduled registry, run log, engine state
pub const CRON_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        BACKGROUND_TASKS_TABLE_V1,
        SCHEDULED_TASKS_TABLE_V1,
        SCHEDULED_TASK_LOG_TABLE_V1,
        ENGINE_STATE_TABLE_V1,
    ],
    migration: None, // Initial version has no migration
}];
