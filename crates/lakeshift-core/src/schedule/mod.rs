//! Recurring and one-shot migration jobs.

pub mod model;

pub use model::{LastRun, MigrationTemplate, NewSchedule, Schedule, SchedulePatch, ScheduleSpec};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::InventoryStore;
use crate::coordinator::{BatchCoordinator, MigrationRequest, Trigger};
use crate::error::{EngineError, Result, ScheduleError};
use crate::ledger::Execution;
use crate::types::{JobId, RunId, TriggeredBy};

/// Jobs with a run in flight. `None` while the run is being started.
type ActiveRuns = Arc<SyncMutex<HashMap<JobId, Option<RunId>>>>;

fn lock_active(active: &ActiveRuns) -> MutexGuard<'_, HashMap<JobId, Option<RunId>>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A claim on a job's single in-flight slot. Dropping it frees the slot.
struct JobSlot {
    active: ActiveRuns,
    job_id: JobId,
}

impl JobSlot {
    fn assign(&self, run_id: &RunId) {
        lock_active(&self.active).insert(self.job_id.clone(), Some(run_id.clone()));
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.job_id);
    }
}

pub struct Scheduler {
    schedules: RwLock<BTreeMap<JobId, Schedule>>,
    active: ActiveRuns,
    tick_lock: Mutex<()>,
    coordinator: Arc<BatchCoordinator>,
    inventories: Arc<InventoryStore>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<BatchCoordinator>,
        inventories: Arc<InventoryStore>,
        tick_interval: Duration,
    ) -> Self {
        Scheduler {
            schedules: RwLock::new(BTreeMap::new()),
            active: Arc::new(SyncMutex::new(HashMap::new())),
            tick_lock: Mutex::new(()),
            coordinator,
            inventories,
            tick_interval,
        }
    }

    pub async fn create(&self, new: NewSchedule) -> Result<Schedule> {
        new.spec.validate()?;
        let now = Utc::now();
        let schedule = Schedule {
            job_id: JobId::generate(),
            name: new.name,
            next_fire_at: new.spec.first_fire(now)?,
            spec: new.spec,
            template: new.template,
            enabled: new.enabled,
            last_run: None,
            created_at: now,
            updated_at: now,
        };
        self.schedules
            .write()
            .await
            .insert(schedule.job_id.clone(), schedule.clone());
        info!(
            job_id = %schedule.job_id,
            name = %schedule.name,
            next_fire_at = ?schedule.next_fire_at,
            "schedule created"
        );
        Ok(schedule)
    }

    pub async fn list(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        schedules
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Schedule> {
        self.schedules
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ScheduleError::NotFound(job_id.clone()).into())
    }

    /// Apply `patch`. A new spec, or re-enabling, re-arms `next_fire_at`.
    pub async fn update(&self, job_id: &JobId, patch: SchedulePatch) -> Result<Schedule> {
        if let Some(spec) = &patch.spec {
            spec.validate()?;
        }
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(job_id)
            .ok_or_else(|| ScheduleError::NotFound(job_id.clone()))?;

        let now = Utc::now();
        let re_enabled = patch.enabled == Some(true) && !schedule.enabled;
        let mut rearm = re_enabled && !matches!(schedule.spec, ScheduleSpec::Once { .. });
        if let Some(name) = patch.name {
            schedule.name = name;
        }
        if let Some(spec) = patch.spec {
            schedule.spec = spec;
            rearm = true;
        }
        if let Some(template) = patch.template {
            schedule.template = template;
        }
        if let Some(enabled) = patch.enabled {
            schedule.enabled = enabled;
        }
        if rearm {
            schedule.next_fire_at = schedule.spec.first_fire(now)?;
        }
        schedule.updated_at = now;

        info!(job_id = %job_id, enabled = schedule.enabled, next_fire_at = ?schedule.next_fire_at, "schedule updated");
        Ok(schedule.clone())
    }

    /// Remove a schedule. A run already in flight continues.
    pub async fn delete(&self, job_id: &JobId) -> Result<()> {
        self.schedules
            .write()
            .await
            .remove(job_id)
            .ok_or_else(|| ScheduleError::NotFound(job_id.clone()))?;
        info!(job_id = %job_id, "schedule deleted");
        Ok(())
    }

    /// Fire a schedule out of band. `next_fire_at` is left untouched.
    ///
    /// Rejections (a run already in flight, an unloadable inventory) are
    /// recorded as Executions before the error is returned.
    pub async fn run_now(&self, job_id: &JobId) -> Result<Execution> {
        let schedule = self.get(job_id).await?;
        let slot = match self.reserve(job_id) {
            Ok(slot) => slot,
            Err(e) => {
                self.reject(job_id, TriggeredBy::Manual, &e).await?;
                return Err(e.into());
            }
        };
        match self.dispatch(&schedule, TriggeredBy::Manual, slot).await {
            Ok(execution) => {
                self.note_fired(job_id, &execution, None).await;
                Ok(execution)
            }
            Err(EngineError::Schedule(e)) => {
                self.reject(job_id, TriggeredBy::Manual, &e).await?;
                Err(e.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Fire every due schedule once. Ticks never overlap.
    ///
    /// A job whose previous run is still in flight is deferred: it neither
    /// fires nor advances, and is retried on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        let _guard = self.tick_lock.lock().await;
        let due: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();

        let mut fired = Vec::new();
        for schedule in due {
            let job_id = &schedule.job_id;
            let next = match schedule.spec.next_after(schedule.next_fire_at, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "cannot compute next fire; disabling");
                    self.disable(job_id).await;
                    self.reject_into(&mut fired, job_id, e.kind(), e.to_string()).await;
                    continue;
                }
            };
            let slot = match self.reserve(job_id) {
                Ok(slot) => slot,
                Err(e) => {
                    debug!(job_id = %job_id, reason = %e, "due fire deferred");
                    continue;
                }
            };

            match self.dispatch(&schedule, TriggeredBy::Scheduled, slot).await {
                Ok(execution) => {
                    self.note_fired(job_id, &execution, Some(next)).await;
                    fired.push(execution);
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "scheduled fire rejected");
                    self.advance(job_id, next).await;
                    self.reject_into(&mut fired, job_id, e.kind(), e.to_string()).await;
                }
            }
        }
        Ok(fired)
    }

    /// Tick on a fixed interval until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop(shutdown).await })
    }

    pub async fn run_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.tick_interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.coordinator.ledger().retry_unrecorded().await {
                        warn!(error = %e, "unrecorded runs still pending");
                    }
                    match self.tick(Utc::now()).await {
                        Ok(fired) if !fired.is_empty() => {
                            debug!(fired = fired.len(), "scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "scheduler tick failed"),
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// The run currently in flight for `job_id`, if any.
    pub async fn active_run(&self, job_id: &JobId) -> Option<RunId> {
        lock_active(&self.active).get(job_id).cloned().flatten()
    }

    /// Claim the job's single in-flight slot.
    fn reserve(&self, job_id: &JobId) -> std::result::Result<JobSlot, ScheduleError> {
        let mut active = lock_active(&self.active);
        if let Some(current) = active.get(job_id) {
            return Err(ScheduleError::AlreadyRunning {
                job_id: job_id.clone(),
                run_id: current.clone().unwrap_or_else(|| RunId::from("starting")),
            });
        }
        active.insert(job_id.clone(), None);
        Ok(JobSlot {
            active: self.active.clone(),
            job_id: job_id.clone(),
        })
    }

    /// Start a run for a reserved job. The slot moves into the run and is
    /// freed once the run is recorded, or right away if it fails to start.
    async fn dispatch(
        &self,
        schedule: &Schedule,
        triggered_by: TriggeredBy,
        slot: JobSlot,
    ) -> Result<Execution> {
        let job_id = &schedule.job_id;
        let template = &schedule.template;

        let inventory = self
            .inventories
            .load(&template.inventory_ref)
            .await
            .map_err(|e| {
                ScheduleError::InventoryUnavailable(format!("{}: {e}", template.inventory_ref))
            })?;

        let request = MigrationRequest {
            inventory: Arc::new(inventory),
            inventory_ref: template.inventory_ref.clone(),
            target_catalog: template.target_catalog.clone(),
            target_schema: template.target_schema.clone(),
            dry_run: template.dry_run,
        };
        let run_id = RunId::generate();
        slot.assign(&run_id);
        let handle = self
            .coordinator
            .start_as(
                run_id,
                request,
                Trigger::for_job(job_id.clone(), triggered_by),
                Some(Box::new(move || drop(slot))),
            )
            .await?;

        let execution = handle.execution.clone();
        info!(job_id = %job_id, run_id = ?execution.run_id, triggered_by = %triggered_by, "job fired");
        Ok(execution)
    }

    async fn reject(
        &self,
        job_id: &JobId,
        triggered_by: TriggeredBy,
        error: &ScheduleError,
    ) -> Result<Execution> {
        let execution =
            Execution::rejected(Some(job_id.clone()), triggered_by, error.kind(), error.to_string());
        self.coordinator.ledger().append_execution(execution).await
    }

    /// Record a failed scheduled fire and collect its Execution.
    async fn reject_into(
        &self,
        fired: &mut Vec<Execution>,
        job_id: &JobId,
        kind: &str,
        message: String,
    ) {
        let execution =
            Execution::rejected(Some(job_id.clone()), TriggeredBy::Scheduled, kind, message);
        match self.coordinator.ledger().append_execution(execution).await {
            Ok(execution) => fired.push(execution),
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to record rejection"),
        }
    }

    async fn note_fired(
        &self,
        job_id: &JobId,
        execution: &Execution,
        next_fire_at: Option<Option<DateTime<Utc>>>,
    ) {
        let mut schedules = self.schedules.write().await;
        let Some(schedule) = schedules.get_mut(job_id) else {
            return;
        };
        if let Some(run_id) = &execution.run_id {
            schedule.last_run = Some(LastRun {
                run_id: run_id.clone(),
                execution_id: execution.execution_id.clone(),
                fired_at: execution.timestamp,
                triggered_by: execution.triggered_by,
            });
        }
        if let Some(next) = next_fire_at {
            schedule.next_fire_at = next;
        }
    }

    async fn advance(&self, job_id: &JobId, next_fire_at: Option<DateTime<Utc>>) {
        if let Some(schedule) = self.schedules.write().await.get_mut(job_id) {
            schedule.next_fire_at = next_fire_at;
        }
    }

    async fn disable(&self, job_id: &JobId) {
        if let Some(schedule) = self.schedules.write().await.get_mut(job_id) {
            schedule.enabled = false;
            schedule.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactHandle, MemoryArtifactStore};
    use crate::config::EngineConfig;
    use crate::error::{ExecutionError, TranslateError, ValidationError};
    use crate::inventory::{InventoryBuilder, InventoryItem};
    use crate::ledger::{ExecutionOutcome, Ledger};
    use crate::target::{TargetChange, TargetExecutor};
    use crate::translate::{TranslationRequest, Translator};
    use crate::types::{ConnectionId, ObjectType, SourceDialect};
    use async_trait::async_trait;

    struct Passthrough;

    #[async_trait]
    impl Translator for Passthrough {
        async fn translate(&self, req: TranslationRequest<'_>) -> std::result::Result<String, TranslateError> {
            Ok(req.source_sql.to_string())
        }
    }

    struct Accepting;

    #[async_trait]
    impl TargetExecutor for Accepting {
        async fn validate(&self, _sql: &str) -> std::result::Result<(), ValidationError> {
            Ok(())
        }

        async fn execute(&self, _sql: &str) -> std::result::Result<TargetChange, ExecutionError> {
            Ok(TargetChange::RowsAffected(0))
        }
    }

    async fn scheduler() -> (Scheduler, ArtifactHandle) {
        let ledger = Arc::new(Ledger::sqlite(":memory:", 50).await.unwrap());
        let coordinator = Arc::new(BatchCoordinator::new(
            Arc::new(Passthrough),
            Arc::new(Accepting),
            ledger,
            &EngineConfig::default(),
        ));
        let inventories = Arc::new(InventoryStore::new(Arc::new(MemoryArtifactStore::new())));

        let mut builder = InventoryBuilder::new(ConnectionId::from("c1"), SourceDialect::MySql, "shop");
        builder.add_schema(
            "shop",
            vec![InventoryItem {
                schema: "shop".into(),
                name: "orders".into(),
                object_type: ObjectType::Table,
                source_definition: "CREATE TABLE orders (id INT)".into(),
                columns: vec![],
                row_count: None,
            }],
        );
        let handle = inventories.save(&builder.finish().unwrap()).await.unwrap();
        (
            Scheduler::new(coordinator, inventories, Duration::from_secs(30)),
            handle,
        )
    }

    fn new_schedule(inventory_ref: ArtifactHandle, spec: ScheduleSpec) -> NewSchedule {
        NewSchedule {
            name: "nightly".into(),
            spec,
            template: MigrationTemplate {
                inventory_ref,
                target_catalog: "main".into(),
                target_schema: "shop".into(),
                dry_run: true,
            },
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_crud() {
        let (scheduler, inv) = scheduler().await;
        let created = scheduler
            .create(new_schedule(inv, ScheduleSpec::Interval { seconds: 3600 }))
            .await
            .unwrap();
        assert!(created.next_fire_at.unwrap() > created.created_at);
        assert_eq!(scheduler.list().await.len(), 1);

        let updated = scheduler
            .update(
                &created.job_id,
                SchedulePatch {
                    enabled: Some(false),
                    name: Some("weekly".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.name, "weekly");
        assert_eq!(updated.next_fire_at, created.next_fire_at);

        scheduler.delete(&created.job_id).await.unwrap();
        let err = scheduler.delete(&created.job_id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let err = scheduler.get(&created.job_id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_spec() {
        let (scheduler, inv) = scheduler().await;
        let err = scheduler
            .create(new_schedule(inv, ScheduleSpec::Interval { seconds: 0 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_spec");
        assert!(scheduler.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let (scheduler, _) = scheduler().await;
        let err = scheduler
            .update(&JobId::from("ghost"), SchedulePatch::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_run_now_keeps_next_fire() {
        let (scheduler, inv) = scheduler().await;
        let created = scheduler
            .create(new_schedule(inv, ScheduleSpec::Interval { seconds: 3600 }))
            .await
            .unwrap();

        let execution = scheduler.run_now(&created.job_id).await.unwrap();
        assert_eq!(execution.triggered_by, TriggeredBy::Manual);
        let run_id = execution.run_id.clone().unwrap();

        let after = scheduler.get(&created.job_id).await.unwrap();
        assert_eq!(after.next_fire_at, created.next_fire_at);
        assert_eq!(after.last_run.unwrap().run_id, run_id);

        let run = scheduler
            .coordinator
            .ledger()
            .await_finished(&run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.job_id, Some(created.job_id));
    }

    #[tokio::test]
    async fn test_missing_inventory_is_recorded_and_advances() {
        let (scheduler, _) = scheduler().await;
        let created = scheduler
            .create(new_schedule(
                ArtifactHandle::from("inventories/gone/inventory.json"),
                ScheduleSpec::Interval { seconds: 60 },
            ))
            .await
            .unwrap();
        let due = created.next_fire_at.unwrap();

        let fired = scheduler.tick(due).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].run_id.is_none());
        assert!(fired[0].integrity_hash.is_some());

        let after = scheduler.get(&created.job_id).await.unwrap();
        assert!(after.next_fire_at.unwrap() > due);
        assert!(after.last_run.is_none());
        assert!(scheduler.active_run(&created.job_id).await.is_none());

        let err = scheduler.run_now(&created.job_id).await.unwrap_err();
        assert_eq!(err.kind(), "inventory_unavailable");
        let history = scheduler
            .coordinator
            .ledger()
            .list_executions(Some(&created.job_id), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_once_fires_once() {
        let (scheduler, inv) = scheduler().await;
        let when = Utc::now() - chrono::Duration::minutes(5);
        let created = scheduler
            .create(new_schedule(inv, ScheduleSpec::Once { at: when }))
            .await
            .unwrap();
        assert_eq!(created.next_fire_at, Some(when));

        let now = Utc::now();
        let fired = scheduler.tick(now).await.unwrap();
        assert_eq!(fired.len(), 1);
        let after = scheduler.get(&created.job_id).await.unwrap();
        assert_eq!(after.next_fire_at, None);

        let run_id = fired[0].run_id.clone().unwrap();
        scheduler
            .coordinator
            .ledger()
            .await_finished(&run_id)
            .await
            .unwrap();
        assert!(scheduler.tick(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unschedulable_fire_is_recorded_and_disables() {
        let (scheduler, inv) = scheduler().await;
        // Arms once, but the following fire falls past the end of the calendar.
        let created = scheduler
            .create(new_schedule(inv, ScheduleSpec::Interval { seconds: 6_000_000_000_000 }))
            .await
            .unwrap();
        let due = created.next_fire_at.unwrap();

        let fired = scheduler.tick(due).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].run_id.is_none());
        match &fired[0].outcome {
            ExecutionOutcome::Rejected { kind, .. } => assert_eq!(kind, "invalid_spec"),
            other => panic!("unexpected outcome {other:?}"),
        }

        let after = scheduler.get(&created.job_id).await.unwrap();
        assert!(!after.enabled);
        assert!(scheduler.tick(due).await.unwrap().is_empty());
        let history = scheduler
            .coordinator
            .ledger()
            .list_executions(Some(&created.job_id), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }
}
