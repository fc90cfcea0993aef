//! Handler resolution and task execution.
//!
//! A claimed task is resolved to a handler in two steps: the explicit
//! handler registry first, then the named scheduled-task table. A task whose
//! name resolves to neither is poison; it is removed from the queue and
//! reported exactly once, never retried. An execution failure is a different
//! thing entirely: the record stays claimed and becomes eligible for
//! re-claiming once the claim threshold passes.

use crate::report::ErrorReporter;
use crate::task_store::{TaskRecord, TaskStore, TimeUnit};
use crate::trigger;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors a handler can produce during execution.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Bad payload: {0}")]
    BadPayload(String),
}

/// Everything a handler gets to work with.
pub struct TaskContext {
    pub store: Arc<dyn TaskStore>,
    /// Unix timestamp of the engine invocation.
    pub now: i64,
}

/// A unit of deferred work.
///
/// Handlers are executed synchronously from the runner's drain loop and must
/// tolerate the occasional duplicate execution (delivery is at-least-once).
pub trait BackgroundHandler: Send + Sync {
    /// Short name the queue resolves against.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn execute(&self, ctx: &TaskContext, payload: &serde_json::Value) -> Result<(), TaskError>;
}

/// A handler backed by a row in the scheduled task registry.
pub trait ScheduledHandler: BackgroundHandler {
    /// Recurrence used when the task is first seeded.
    fn default_recurrence(&self) -> (i64, TimeUnit, i64);
}

struct RegisteredHandler {
    handler: Arc<dyn BackgroundHandler>,
    /// Fixed arguments merged into each record's payload. Record keys win.
    extra_payload: Option<serde_json::Value>,
}

/// Explicit map from short names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, RegisteredHandler>,
    scheduled: HashMap<&'static str, Arc<dyn ScheduledHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn BackgroundHandler>) {
        self.handlers.insert(
            handler.name(),
            RegisteredHandler {
                handler,
                extra_payload: None,
            },
        );
    }

    pub fn register_with_payload(
        &mut self,
        handler: Arc<dyn BackgroundHandler>,
        extra_payload: serde_json::Value,
    ) {
        self.handlers.insert(
            handler.name(),
            RegisteredHandler {
                handler,
                extra_payload: Some(extra_payload),
            },
        );
    }

    pub fn register_scheduled(&mut self, handler: Arc<dyn ScheduledHandler>) {
        self.scheduled.insert(handler.name(), handler);
    }

    pub fn scheduled_handlers(&self) -> impl Iterator<Item = &Arc<dyn ScheduledHandler>> {
        self.scheduled.values()
    }

    fn merge_payload(
        extra: Option<&serde_json::Value>,
        record: &serde_json::Value,
    ) -> serde_json::Value {
        let Some(serde_json::Value::Object(extra_map)) = extra else {
            return record.clone();
        };
        let mut merged = extra_map.clone();
        if let serde_json::Value::Object(record_map) = record {
            for (key, value) in record_map {
                merged.insert(key.clone(), value.clone());
            }
        }
        serde_json::Value::Object(merged)
    }
}

/// Outcome of one dispatch, as seen by the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; the record was removed.
    Completed,
    /// Handler failed; the record stays claimed and will be re-claimed
    /// after the threshold.
    Failed,
    /// No handler resolves this record; it was removed and reported.
    Poisoned,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    registry: HandlerRegistry,
    reporter: Arc<dyn ErrorReporter>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            store,
            registry,
            reporter,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one claimed record and settle its queue state.
    pub fn dispatch(&self, record: &TaskRecord, now: i64) -> anyhow::Result<DispatchOutcome> {
        if let Some(registered) = self.registry.handlers.get(record.handler_name.as_str()) {
            let payload =
                HandlerRegistry::merge_payload(registered.extra_payload.as_ref(), &record.payload);
            return self.run_background(record, registered.handler.as_ref(), &payload, now);
        }

        if let Some(handler) = self.registry.scheduled.get(record.handler_name.as_str()) {
            return self.run_scheduled(record, handler.clone(), now);
        }

        // Nothing resolves this name; retrying would fail forever
        warn!(
            "Removing task {} with unresolvable handler '{}'",
            record.id, record.handler_name
        );
        self.store.remove_task(record.id)?;
        self.reporter.report(
            &format!("No handler registered for task '{}'", record.handler_name),
            "task_dispatch",
            Some(&record.handler_name),
        );
        Ok(DispatchOutcome::Poisoned)
    }

    fn run_background(
        &self,
        record: &TaskRecord,
        handler: &dyn BackgroundHandler,
        payload: &serde_json::Value,
        now: i64,
    ) -> anyhow::Result<DispatchOutcome> {
        let ctx = TaskContext {
            store: self.store.clone(),
            now,
        };

        debug!("Executing task {} ({})", record.id, record.handler_name);
        match handler.execute(&ctx, payload) {
            Ok(()) => {
                self.store.remove_task(record.id)?;
                Ok(DispatchOutcome::Completed)
            }
            Err(e) => {
                warn!(
                    "Task {} ({}) failed, leaving claimed for retry: {}",
                    record.id, record.handler_name, e
                );
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    fn run_scheduled(
        &self,
        record: &TaskRecord,
        handler: Arc<dyn ScheduledHandler>,
        now: i64,
    ) -> anyhow::Result<DispatchOutcome> {
        let ctx = TaskContext {
            store: self.store.clone(),
            now,
        };

        debug!(
            "Executing scheduled task {} ({})",
            record.id, record.handler_name
        );
        let started = Instant::now();
        match handler.execute(&ctx, &record.payload) {
            Ok(()) => {
                let duration = started.elapsed().as_secs_f64();
                self.store.remove_task(record.id)?;

                if let Some(def) = self.store.get_scheduled_task_by_name(handler.name())? {
                    self.store.append_run_log(def.id, now, duration)?;
                    let next = trigger::next_fire_time(
                        def.time_regularity,
                        def.time_unit,
                        def.time_offset,
                        now,
                    );
                    // Advance-only: a catch-up skip at promote time may have
                    // already stored a later value
                    self.store.raise_next_time(def.id, next)?;
                }
                Ok(DispatchOutcome::Completed)
            }
            Err(e) => {
                warn!(
                    "Scheduled task {} ({}) failed, leaving claimed for retry: {}",
                    record.id, record.handler_name, e
                );
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    /// Execute a named scheduled task immediately, bypassing its schedule.
    /// The run is logged but `next_time` is untouched. Returns false when no
    /// such handler is registered.
    pub fn run_named_now(&self, name: &str, now: i64) -> anyhow::Result<bool> {
        let Some(handler) = self.registry.scheduled.get(name) else {
            return Ok(false);
        };

        let ctx = TaskContext {
            store: self.store.clone(),
            now,
        };

        info!("Running scheduled task '{}' on demand", name);
        let started = Instant::now();
        let payload = serde_json::Value::Object(serde_json::Map::new());
        match handler.execute(&ctx, &payload) {
            Ok(()) => {
                let duration = started.elapsed().as_secs_f64();
                if let Some(def) = self.store.get_scheduled_task_by_name(name)? {
                    self.store.append_run_log(def.id, now, duration)?;
                }
                Ok(true)
            }
            Err(e) => {
                warn!("On-demand run of '{}' failed: {}", name, e);
                Ok(true)
            }
        }
    }
}
