use super::models::{ScheduledTaskDef, TaskRecord, TaskRunLogEntry, TimeUnit};
use super::schema::CRON_VERSIONED_SCHEMAS;
use super::TaskStore;
use crate::sqlite_persistence::versioned_schema::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Key in `engine_state` holding the global minimum next-fire timestamp.
const NEXT_TASK_TIME_KEY: &str = "next_task_time";

/// Losing this many claim races in a row means other workers are draining
/// the queue anyway; give up and report an empty store.
const MAX_CLAIM_ATTEMPTS: usize = 8;

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open cron database")?;
        // Other processes may hold the write lock mid-claim; wait rather
        // than surfacing SQLITE_BUSY
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        if is_new_db {
            // Fresh database - create with latest schema
            info!("Creating new cron database at {:?}", path);
            CRON_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
        } else {
            // Existing database - check version and migrate if needed
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;

            if db_version < 1 {
                anyhow::bail!(
                    "Cron database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let current_schema_version = CRON_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .version as i64;

            let version_index = CRON_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown cron database version {}", db_version))?;
            CRON_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!(
                        "Cron database schema validation failed for version {}",
                        db_version
                    )
                })?;

            if db_version < current_schema_version {
                info!(
                    "Migrating cron database from version {} to {}",
                    db_version, current_schema_version
                );
                Self::migrate_if_needed(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        CRON_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut latest_from = from_version;
        for schema in CRON_VERSIONED_SCHEMAS.iter().skip(from_version) {
            if schema.version > from_version {
                info!(
                    "Running cron database migration from version {} to {}",
                    latest_from, schema.version
                );
                if let Some(migration_fn) = schema.migration {
                    migration_fn(&tx).with_context(|| {
                        format!("Failed to run migration to version {}", schema.version)
                    })?;
                }
                latest_from = schema.version;
            }
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn row_to_task_record(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
        let payload_str: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload_str)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        Ok(TaskRecord {
            id: row.get("id")?,
            handler_name: row.get("handler_name")?,
            payload,
            claimed_at: row.get("claimed_at")?,
        })
    }

    fn row_to_scheduled_def(row: &rusqlite::Row) -> rusqlite::Result<ScheduledTaskDef> {
        let unit_str: String = row.get("time_unit")?;
        let time_unit = TimeUnit::parse(&unit_str).unwrap_or(TimeUnit::Day);
        let disabled: i64 = row.get("disabled")?;

        Ok(ScheduledTaskDef {
            id: row.get("id")?,
            name: row.get("name")?,
            next_time: row.get("next_time")?,
            time_offset: row.get("time_offset")?,
            time_regularity: row.get("time_regularity")?,
            time_unit,
            disabled: disabled != 0,
        })
    }

    fn row_to_log_entry(row: &rusqlite::Row) -> rusqlite::Result<TaskRunLogEntry> {
        Ok(TaskRunLogEntry {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            ran_at: row.get("ran_at")?,
            duration: row.get("duration")?,
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert_task(&self, handler_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO background_tasks (handler_name, payload) VALUES (?1, ?2)",
            params![handler_name, payload.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn claim_one(&self, claim_threshold: i64, now: i64) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().unwrap();

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let candidate = conn
                .query_row(
                    "SELECT id, handler_name, payload, claimed_at FROM background_tasks
                     WHERE claimed_at = 0 OR ?1 - claimed_at > ?2
                     ORDER BY id LIMIT 1",
                    params![now, claim_threshold],
                    Self::row_to_task_record,
                )
                .optional()?;

            let Some(mut record) = candidate else {
                return Ok(None);
            };

            // The claim only succeeds if claimed_at still holds the value we
            // just read; zero affected rows means another worker got there
            // first and we search again.
            let updated = conn.execute(
                "UPDATE background_tasks SET claimed_at = ?1 WHERE id = ?2 AND claimed_at = ?3",
                params![now, record.id, record.claimed_at],
            )?;

            if updated == 1 {
                record.claimed_at = now;
                return Ok(Some(record));
            }
        }

        warn!(
            "Gave up claiming a task after {} lost races",
            MAX_CLAIM_ATTEMPTS
        );
        Ok(None)
    }

    fn remove_task(&self, task_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM background_tasks WHERE id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    fn pending_task_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM background_tasks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn get_scheduled_task(&self, task_id: i64) -> Result<Option<ScheduledTaskDef>> {
        let conn = self.conn.lock().unwrap();
        let def = conn
            .query_row(
                "SELECT id, name, next_time, time_offset, time_regularity, time_unit, disabled
                 FROM scheduled_tasks WHERE id = ?1",
                params![task_id],
                Self::row_to_scheduled_def,
            )
            .optional()?;
        Ok(def)
    }

    fn get_scheduled_task_by_name(&self, name: &str) -> Result<Option<ScheduledTaskDef>> {
        let conn = self.conn.lock().unwrap();
        let def = conn
            .query_row(
                "SELECT id, name, next_time, time_offset, time_regularity, time_unit, disabled
                 FROM scheduled_tasks WHERE name = ?1",
                params![name],
                Self::row_to_scheduled_def,
            )
            .optional()?;
        Ok(def)
    }

    fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTaskDef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, next_time, time_offset, time_regularity, time_unit, disabled
             FROM scheduled_tasks ORDER BY name",
        )?;
        let defs = stmt
            .query_map([], Self::row_to_scheduled_def)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(defs)
    }

    fn due_scheduled_tasks(&self, now: i64) -> Result<Vec<ScheduledTaskDef>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, next_time, time_offset, time_regularity, time_unit, disabled
             FROM scheduled_tasks WHERE disabled = 0 AND next_time <= ?1
             ORDER BY next_time",
        )?;
        let defs = stmt
            .query_map(params![now], Self::row_to_scheduled_def)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(defs)
    }

    fn upsert_scheduled_task(&self, def: &ScheduledTaskDef) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks (name, next_time, time_offset, time_regularity, time_unit)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 time_offset = ?3, time_regularity = ?4, time_unit = ?5",
            params![
                def.name,
                def.next_time,
                def.time_offset,
                def.time_regularity,
                def.time_unit.as_str()
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM scheduled_tasks WHERE name = ?1",
            params![def.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn set_disabled(&self, task_id: i64, disabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_tasks SET disabled = ?1 WHERE id = ?2",
            params![disabled as i64, task_id],
        )?;
        Ok(())
    }

    fn advance_next_time(&self, task_id: i64, old: i64, new: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE scheduled_tasks SET next_time = ?1 WHERE id = ?2 AND next_time = ?3",
            params![new, task_id, old],
        )?;
        Ok(updated == 1)
    }

    fn raise_next_time(&self, task_id: i64, new: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_tasks SET next_time = ?1 WHERE id = ?2 AND next_time < ?1",
            params![new, task_id],
        )?;
        Ok(())
    }

    fn force_next_time(&self, task_id: i64, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_tasks SET next_time = ?1 WHERE id = ?2",
            params![value, task_id],
        )?;
        Ok(())
    }

    fn append_run_log(&self, task_id: i64, ran_at: i64, duration: f64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_task_log (task_id, ran_at, duration) VALUES (?1, ?2, ?3)",
            params![task_id, ran_at, duration],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn run_log_for_task(&self, task_id: i64, limit: usize) -> Result<Vec<TaskRunLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, ran_at, duration FROM scheduled_task_log
             WHERE task_id = ?1 ORDER BY ran_at DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![task_id, limit as i64], Self::row_to_log_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn prune_run_log(&self, before_timestamp: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM scheduled_task_log WHERE ran_at < ?1",
            params![before_timestamp],
        )?;
        Ok(deleted)
    }

    fn next_task_time(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![NEXT_TASK_TIME_KEY],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.and_then(|v| v.parse::<i64>().ok()))
    }

    fn set_next_task_time(&self, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO engine_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![NEXT_TASK_TIME_KEY, value.to_string(), now],
        )?;
        Ok(())
    }
}
