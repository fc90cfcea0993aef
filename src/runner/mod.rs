//! Engine orchestration: promote due scheduled tasks, drain the queue under
//! a wall-clock budget, then spend any leftover time on outbound mail.
//!
//! An invocation is bounded, not resident: whether it came from a real cron
//! entry, the CLI, or the HTTP pixel, it does what fits in the budget and
//! exits. The budget is checked between task executions only; a slow handler
//! overruns it by however long its own execution takes.

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::mail::MailQueue;
use crate::task_store::{
    ScheduledTaskInfo, TaskStore, CLAIM_THRESHOLD, MAX_CRON_TIME,
};
use crate::trigger;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wall-clock budget for one engine invocation.
pub struct TimeBudget {
    started: Instant,
    budget: Duration,
}

impl TimeBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// True while at least half the original budget is still available.
    pub fn has_half_left(&self) -> bool {
        self.remaining() * 2 >= self.budget
    }
}

/// Counters for one engine invocation.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RunSummary {
    pub promoted: usize,
    pub completed: usize,
    pub failed: usize,
    pub poisoned: usize,
    pub mail_batches: usize,
    pub budget_expired: bool,
}

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    dispatcher: Dispatcher,
    mail: Arc<dyn MailQueue>,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Dispatcher, mail: Arc<dyn MailQueue>) -> Self {
        Self {
            store,
            dispatcher,
            mail,
        }
    }

    pub fn registry(&self) -> &crate::dispatch::HandlerRegistry {
        self.dispatcher.registry()
    }

    /// One full engine invocation with the default budget.
    pub fn run(&self) -> Result<RunSummary> {
        self.run_with_budget(Duration::from_secs(MAX_CRON_TIME as u64))
    }

    pub fn run_with_budget(&self, budget: Duration) -> Result<RunSummary> {
        let budget = TimeBudget::new(budget);
        let mut summary = RunSummary::default();

        let now = Utc::now().timestamp();
        summary.promoted = self.promote_due(now)?;

        // Drain loop: claim, dispatch, settle, until empty or out of time
        loop {
            if budget.expired() {
                summary.budget_expired = true;
                break;
            }

            let now = Utc::now().timestamp();
            let Some(record) = self.store.claim_one(CLAIM_THRESHOLD, now)? else {
                break;
            };

            match self.dispatcher.dispatch(&record, now)? {
                DispatchOutcome::Completed => summary.completed += 1,
                DispatchOutcome::Failed => summary.failed += 1,
                DispatchOutcome::Poisoned => summary.poisoned += 1,
            }
        }

        // Mail is strictly lower priority: only with half the budget intact
        if !summary.budget_expired && budget.has_half_left() && self.mail.has_pending_work() {
            match self.mail.drain_one_batch() {
                Ok(sent) => {
                    if sent > 0 {
                        debug!("Drained one mail batch ({} messages)", sent);
                        summary.mail_batches = 1;
                    }
                }
                Err(e) => warn!("Mail batch failed: {}", e),
            }
        }

        info!(
            "Cron run finished in {:.2}s: {} promoted, {} completed, {} failed, {} poisoned",
            budget.elapsed().as_secs_f64(),
            summary.promoted,
            summary.completed,
            summary.failed,
            summary.poisoned
        );
        Ok(summary)
    }

    /// Single promote + claim + dispatch cycle, no loop.
    pub fn run_one_task(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let now = Utc::now().timestamp();
        summary.promoted = self.promote_due(now)?;

        if let Some(record) = self.store.claim_one(CLAIM_THRESHOLD, now)? {
            match self.dispatcher.dispatch(&record, now)? {
                DispatchOutcome::Completed => summary.completed += 1,
                DispatchOutcome::Failed => summary.failed += 1,
                DispatchOutcome::Poisoned => summary.poisoned += 1,
            }
        }
        Ok(summary)
    }

    /// Execute the named scheduled tasks immediately, bypassing their
    /// schedules. Returns the number of tasks that actually ran.
    pub fn run_named_tasks_now(&self, names: &[String]) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut ran = 0;
        for name in names {
            if self.dispatcher.run_named_now(name, now)? {
                ran += 1;
            } else {
                warn!("No scheduled task named '{}'", name);
            }
        }
        Ok(ran)
    }

    /// Move every due scheduled task into the queue. Returns the number of
    /// tasks promoted.
    pub fn promote_due(&self, now: i64) -> Result<usize> {
        // Cheap gate: skip the registry scan entirely until something is due
        if let Some(gate) = self.store.next_task_time()? {
            if gate > now {
                return Ok(0);
            }
        }

        let due = self.store.due_scheduled_tasks(now)?;
        let mut promoted = 0;

        for def in due {
            let new_next = trigger::catch_up_next_fire_time(
                def.time_regularity,
                def.time_unit,
                def.time_offset,
                def.next_time,
                now,
            );

            // Advancing next_time before the insert is what makes promotion
            // race-safe: only the worker whose conditional update lands gets
            // to enqueue the record
            if self.store.advance_next_time(def.id, def.next_time, new_next)? {
                self.store
                    .insert_task(&def.name, &json!({ "scheduled_task_id": def.id }))?;
                debug!(
                    "Promoted scheduled task '{}' (next fire {})",
                    def.name, new_next
                );
                promoted += 1;
            }
        }

        self.refresh_next_task_time()?;
        Ok(promoted)
    }

    /// Recompute the global next-fire cache as the minimum across enabled
    /// definitions.
    fn refresh_next_task_time(&self) -> Result<()> {
        let min = self
            .store
            .list_scheduled_tasks()?
            .into_iter()
            .filter(|def| !def.disabled)
            .map(|def| def.next_time)
            .min();

        if let Some(min) = min {
            self.store.set_next_task_time(min)?;
        }
        Ok(())
    }

    /// Serializable summaries of every registered scheduled task.
    pub fn scheduled_task_infos(&self) -> Result<Vec<ScheduledTaskInfo>> {
        let mut infos = Vec::new();
        for def in self.store.list_scheduled_tasks()? {
            let last_ran_at = self
                .store
                .run_log_for_task(def.id, 1)?
                .first()
                .map(|entry| entry.ran_at);
            infos.push(ScheduledTaskInfo {
                id: def.id,
                name: def.name,
                next_time: def.next_time,
                time_unit: def.time_unit,
                time_regularity: def.time_regularity,
                time_offset: def.time_offset,
                disabled: def.disabled,
                last_ran_at,
            });
        }
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{
        BackgroundHandler, HandlerRegistry, ScheduledHandler, TaskContext, TaskError,
    };
    use crate::mail::testing::FakeMailQueue;
    use crate::mail::NullMailQueue;
    use crate::report::testing::RecordingReporter;
    use crate::task_store::{ScheduledTaskDef, SqliteTaskStore, TimeUnit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandler {
        executions: AtomicUsize,
    }

    impl NoopHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executions: AtomicUsize::new(0),
            })
        }
    }

    impl BackgroundHandler for NoopHandler {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn description(&self) -> &'static str {
            "does nothing"
        }
        fn execute(
            &self,
            _ctx: &TaskContext,
            _payload: &serde_json::Value,
        ) -> Result<(), TaskError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct HourlyHandler;

    impl BackgroundHandler for HourlyHandler {
        fn name(&self) -> &'static str {
            "hourly_task"
        }
        fn description(&self) -> &'static str {
            "test hourly task"
        }
        fn execute(
            &self,
            _ctx: &TaskContext,
            _payload: &serde_json::Value,
        ) -> Result<(), TaskError> {
            Ok(())
        }
    }

    impl ScheduledHandler for HourlyHandler {
        fn default_recurrence(&self) -> (i64, TimeUnit, i64) {
            (1, TimeUnit::Hour, 0)
        }
    }

    fn runner_with(
        registry: HandlerRegistry,
        mail: Arc<dyn MailQueue>,
    ) -> (Arc<SqliteTaskStore>, TaskRunner) {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            Arc::new(RecordingReporter::default()),
        );
        let runner = TaskRunner::new(store.clone(), dispatcher, mail);
        (store, runner)
    }

    fn hourly_def() -> ScheduledTaskDef {
        ScheduledTaskDef {
            id: 0,
            name: "hourly_task".to_string(),
            next_time: 0,
            time_offset: 0,
            time_regularity: 1,
            time_unit: TimeUnit::Hour,
            disabled: false,
        }
    }

    #[test]
    fn test_time_budget_expiry() {
        let budget = TimeBudget::new(Duration::ZERO);
        assert!(budget.expired());
        assert_eq!(budget.remaining(), Duration::ZERO);

        let budget = TimeBudget::new(Duration::from_secs(60));
        assert!(!budget.expired());
        assert!(budget.has_half_left());
        assert!(budget.remaining() <= Duration::from_secs(60));
    }

    #[test]
    fn test_drain_empties_queue_of_noops() {
        let handler = NoopHandler::new();
        let mut registry = HandlerRegistry::new();
        registry.register(handler.clone());
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        for _ in 0..5 {
            store.insert_task("noop", &serde_json::json!({})).unwrap();
        }

        let summary = runner.run_with_budget(Duration::from_secs(60)).unwrap();
        assert_eq!(summary.completed, 5);
        assert_eq!(summary.failed, 0);
        assert!(!summary.budget_expired);
        assert_eq!(handler.executions.load(Ordering::SeqCst), 5);
        assert_eq!(store.pending_task_count().unwrap(), 0);
    }

    #[test]
    fn test_zero_budget_leaves_queue_untouched() {
        let mut registry = HandlerRegistry::new();
        registry.register(NoopHandler::new());
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        store.insert_task("noop", &serde_json::json!({})).unwrap();

        let summary = runner.run_with_budget(Duration::ZERO).unwrap();
        assert!(summary.budget_expired);
        assert_eq!(summary.completed, 0);
        assert_eq!(store.pending_task_count().unwrap(), 1);
    }

    #[test]
    fn test_overdue_hourly_promotes_one_record_with_skip() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        let id = store.upsert_scheduled_task(&hourly_def()).unwrap();

        // Two hours overdue
        let now = Utc::now().timestamp();
        let old_next = now - 2 * 60 * 60;
        store.force_next_time(id, old_next).unwrap();

        let promoted = runner.promote_due(now).unwrap();
        assert_eq!(promoted, 1);
        // Exactly one queue record, not one per missed hour
        assert_eq!(store.pending_task_count().unwrap(), 1);

        // More than half a step overdue: one interval is skipped
        let def = store.get_scheduled_task(id).unwrap().unwrap();
        let plain = trigger::next_fire_time(1, TimeUnit::Hour, 0, now);
        assert_eq!(def.next_time, plain + 60 * 60);
    }

    #[test]
    fn test_promote_is_idempotent_within_interval() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        store.upsert_scheduled_task(&hourly_def()).unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(runner.promote_due(now).unwrap(), 1);
        // Second pass sees the advanced next_time and promotes nothing
        assert_eq!(runner.promote_due(now).unwrap(), 0);
        assert_eq!(store.pending_task_count().unwrap(), 1);
    }

    #[test]
    fn test_promote_gated_by_next_task_time_cache() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        store.upsert_scheduled_task(&hourly_def()).unwrap();

        let now = Utc::now().timestamp();
        // Cache says nothing is due until well after now
        store.set_next_task_time(now + 1000).unwrap();
        assert_eq!(runner.promote_due(now).unwrap(), 0);
        assert_eq!(store.pending_task_count().unwrap(), 0);
    }

    #[test]
    fn test_promote_refreshes_cache_to_min_next_time() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        let id = store.upsert_scheduled_task(&hourly_def()).unwrap();

        let now = Utc::now().timestamp();
        runner.promote_due(now).unwrap();

        let def = store.get_scheduled_task(id).unwrap().unwrap();
        assert_eq!(store.next_task_time().unwrap(), Some(def.next_time));
        assert!(def.next_time > now);
    }

    #[test]
    fn test_full_run_executes_promoted_scheduled_task() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        let id = store.upsert_scheduled_task(&hourly_def()).unwrap();

        let summary = runner.run_with_budget(Duration::from_secs(60)).unwrap();
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(store.pending_task_count().unwrap(), 0);
        assert_eq!(store.run_log_for_task(id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_task_never_promoted() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        let id = store.upsert_scheduled_task(&hourly_def()).unwrap();
        store.set_disabled(id, true).unwrap();

        let summary = runner.run_with_budget(Duration::from_secs(60)).unwrap();
        assert_eq!(summary.promoted, 0);
        assert_eq!(store.pending_task_count().unwrap(), 0);
    }

    #[test]
    fn test_mail_drained_with_budget_left() {
        let mail = Arc::new(FakeMailQueue::with_batches(3));
        let (_store, runner) = runner_with(HandlerRegistry::new(), mail.clone());

        let summary = runner.run_with_budget(Duration::from_secs(60)).unwrap();
        // One batch per invocation, never more
        assert_eq!(summary.mail_batches, 1);
        assert_eq!(mail.drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mail_skipped_when_budget_expired() {
        let mail = Arc::new(FakeMailQueue::with_batches(3));
        let (_store, runner) = runner_with(HandlerRegistry::new(), mail.clone());

        let summary = runner.run_with_budget(Duration::ZERO).unwrap();
        assert_eq!(summary.mail_batches, 0);
        assert_eq!(mail.drained.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_one_task_single_cycle() {
        let mut registry = HandlerRegistry::new();
        registry.register(NoopHandler::new());
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        store.insert_task("noop", &serde_json::json!({})).unwrap();
        store.insert_task("noop", &serde_json::json!({})).unwrap();

        let summary = runner.run_one_task().unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(store.pending_task_count().unwrap(), 1);
    }

    #[test]
    fn test_run_named_tasks_now() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        let id = store.upsert_scheduled_task(&hourly_def()).unwrap();
        store.force_next_time(id, 9_999_999_999).unwrap();

        let ran = runner
            .run_named_tasks_now(&["hourly_task".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(ran, 1);
        assert_eq!(store.run_log_for_task(id, 10).unwrap().len(), 1);
        // Bypass path leaves the schedule alone
        let def = store.get_scheduled_task(id).unwrap().unwrap();
        assert_eq!(def.next_time, 9_999_999_999);
    }

    #[test]
    fn test_scheduled_task_infos() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheduled(Arc::new(HourlyHandler));
        let (store, runner) = runner_with(registry, Arc::new(NullMailQueue));

        let id = store.upsert_scheduled_task(&hourly_def()).unwrap();
        store.append_run_log(id, 4242, 0.7).unwrap();

        let infos = runner.scheduled_task_infos().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "hourly_task");
        assert_eq!(infos[0].last_ran_at, Some(4242));
    }
}
