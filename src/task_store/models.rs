//! Data models for the cron task store.

use serde::{Deserialize, Serialize};

/// Wall-clock budget for a single engine invocation, in seconds.
pub const MAX_CRON_TIME: i64 = 10;

/// Age after which a claimed task is considered abandoned and may be
/// re-claimed by another worker, in seconds.
pub const CLAIM_THRESHOLD: i64 = 300;

/// Maximum clock skew accepted on the HTTP trigger's timestamp, in seconds.
pub const TRIGGER_WINDOW: i64 = 900;

/// Default retention for scheduled-task run-log entries, in days.
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 30;

/// Recurrence unit for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minute,
    Hour,
    Day,
    Week,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(TimeUnit::Minute),
            "hour" => Some(TimeUnit::Hour),
            "day" => Some(TimeUnit::Day),
            "week" => Some(TimeUnit::Week),
            _ => None,
        }
    }

    /// Length of one unit in seconds.
    pub fn secs(&self) -> i64 {
        match self {
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 60 * 60,
            TimeUnit::Day => 24 * 60 * 60,
            TimeUnit::Week => 7 * 24 * 60 * 60,
        }
    }
}

/// A queued unit of background work.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: i64,
    pub handler_name: String,
    /// JSON object with handler-specific arguments.
    pub payload: serde_json::Value,
    /// Unix timestamp of the claim, 0 when unclaimed.
    pub claimed_at: i64,
}

/// A registered recurring task definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTaskDef {
    pub id: i64,
    pub name: String,
    /// Unix timestamp of the next fire; 0 means "due immediately".
    pub next_time: i64,
    /// Seconds past UTC midnight anchor (only its minute-of-hour component
    /// matters for the minute unit).
    pub time_offset: i64,
    pub time_regularity: i64,
    pub time_unit: TimeUnit,
    pub disabled: bool,
}

/// One completed run of a scheduled task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub ran_at: i64,
    /// Execution duration in seconds.
    pub duration: f64,
}

/// Serializable summary of a scheduled task, for CLI introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTaskInfo {
    pub id: i64,
    pub name: String,
    pub next_time: i64,
    pub time_unit: TimeUnit,
    pub time_regularity: i64,
    pub time_offset: i64,
    pub disabled: bool,
    pub last_ran_at: Option<i64>,
}
