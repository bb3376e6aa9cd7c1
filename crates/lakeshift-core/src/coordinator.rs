//! Batch coordinator: fans a migration request out over an inventory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, info_span, warn, Instrument};

use crate::artifact::{ArtifactHandle, ArtifactStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::inventory::Inventory;
use crate::ledger::{Execution, ExecutionOutcome, Ledger, LogLevel, MigrationRun, RunTotals};
use crate::pipeline::{MigrationObjectResult, ObjectPipeline, PipelineContext, RunSignals};
use crate::report::ErrorReport;
use crate::target::TargetExecutor;
use crate::translate::Translator;
use crate::types::{JobId, ObjectType, RunId, TriggeredBy};

/// What to migrate and where.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub inventory: Arc<Inventory>,
    pub inventory_ref: ArtifactHandle,
    pub target_catalog: String,
    pub target_schema: String,
    pub dry_run: bool,
}

/// Who asked for a run.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub job_id: Option<JobId>,
    pub triggered_by: TriggeredBy,
}

impl Trigger {
    pub fn manual() -> Self {
        Trigger {
            job_id: None,
            triggered_by: TriggeredBy::Manual,
        }
    }

    pub fn for_job(job_id: JobId, triggered_by: TriggeredBy) -> Self {
        Trigger {
            job_id: Some(job_id),
            triggered_by,
        }
    }
}

/// Called once the run's ledger write was attempted, before waiters wake.
/// Dropped without being called if the run task dies first.
pub type FinalizeHook = Box<dyn FnOnce() + Send + Sync + 'static>;

/// A run in progress.
///
/// `execution` is the pre-allocated record; its ledger row is appended when
/// the run finalizes.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub execution: Execution,
    join: JoinHandle<Result<MigrationRun>>,
}

impl RunHandle {
    /// Wait for finalization and return the frozen run.
    pub async fn wait(self) -> Result<MigrationRun> {
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("run {} task failed: {e}", self.run_id)))?
    }
}

pub struct BatchCoordinator {
    translator: Arc<dyn Translator>,
    executor: Arc<dyn TargetExecutor>,
    ledger: Arc<Ledger>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    max_concurrency: usize,
    call_timeout: Duration,
    excluded: HashSet<ObjectType>,
}

impl BatchCoordinator {
    pub fn new(
        translator: Arc<dyn Translator>,
        executor: Arc<dyn TargetExecutor>,
        ledger: Arc<Ledger>,
        config: &EngineConfig,
    ) -> Self {
        BatchCoordinator {
            translator,
            executor,
            ledger,
            artifacts: None,
            max_concurrency: config.max_concurrency.max(1),
            call_timeout: config.call_timeout(),
            excluded: config.excluded_object_types.iter().copied().collect(),
        }
    }

    /// Write error reports for runs with failures into `store`.
    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Start a run and return immediately; the run progresses in the background.
    pub async fn start(&self, request: MigrationRequest, trigger: Trigger) -> Result<RunHandle> {
        self.start_as(RunId::generate(), request, trigger, None).await
    }

    /// Start a run under a caller-chosen id, with a hook for its finalization.
    #[tracing::instrument(
        skip_all,
        fields(
            run_id = %run_id,
            job_id = ?trigger.job_id,
            items = request.inventory.items.len(),
            dry_run = request.dry_run,
        )
    )]
    pub async fn start_as(
        &self,
        run_id: RunId,
        request: MigrationRequest,
        trigger: Trigger,
        on_recorded: Option<FinalizeHook>,
    ) -> Result<RunHandle> {
        let execution =
            Execution::dispatched(trigger.job_id.clone(), run_id.clone(), trigger.triggered_by);
        let signals = RunSignals::new();

        self.ledger
            .begin(&run_id, request.inventory.items.len(), signals.clone())
            .await?;
        self.ledger
            .log(
                &run_id,
                LogLevel::Info,
                format!(
                    "{} run started: {} objects from {} into {}.{}",
                    if request.dry_run { "dry" } else { "live" },
                    request.inventory.items.len(),
                    request.inventory.source_type.display_name(),
                    request.target_catalog,
                    request.target_schema,
                ),
            )
            .await;

        let ctx = Arc::new(PipelineContext {
            translator: self.translator.clone(),
            executor: self.executor.clone(),
            source_dialect: request.inventory.source_type,
            target_catalog: request.target_catalog.clone(),
            target_schema: request.target_schema.clone(),
            dry_run: request.dry_run,
            excluded: self.excluded.clone(),
            call_timeout: self.call_timeout,
        });

        let span = info_span!(
            "migration_run",
            run_id = %run_id,
            job_id = ?trigger.job_id,
            triggered_by = %trigger.triggered_by,
        );
        let task = RunTask {
            run_id: run_id.clone(),
            job_id: trigger.job_id,
            execution: execution.clone(),
            request,
            ctx,
            signals,
            ledger: self.ledger.clone(),
            artifacts: self.artifacts.clone(),
            max_concurrency: self.max_concurrency,
            on_recorded,
        };
        info!(run_id = %run_id, "run dispatched");
        let join = tokio::spawn(task.drive().instrument(span));

        Ok(RunHandle {
            run_id,
            execution,
            join,
        })
    }
}

struct RunTask {
    run_id: RunId,
    job_id: Option<JobId>,
    execution: Execution,
    request: MigrationRequest,
    ctx: Arc<PipelineContext>,
    signals: RunSignals,
    ledger: Arc<Ledger>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    max_concurrency: usize,
    on_recorded: Option<FinalizeHook>,
}

impl RunTask {
    async fn drive(mut self) -> Result<MigrationRun> {
        let started_at = Utc::now();
        let results = self.fan_out().await;
        self.finalize(started_at, results).await
    }

    /// Process every item; the returned results follow inventory order.
    async fn fan_out(&self) -> Vec<MigrationObjectResult> {
        let items = &self.request.inventory.items;
        let mut slots: Vec<Option<MigrationObjectResult>> = vec![None; items.len()];
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::new();

        for index in 0..items.len() {
            let permit = tokio::select! {
                biased;
                _ = self.signals.stopped() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let inventory = self.request.inventory.clone();
            let ctx = self.ctx.clone();
            let signals = self.signals.clone();
            let ledger = self.ledger.clone();
            let run_id = self.run_id.clone();
            let handle = tasks.spawn(
                async move {
                    let _permit = permit;
                    let item = &inventory.items[index];
                    ledger.object_started(&run_id, &item.qualified_name()).await;
                    let result = ObjectPipeline::new(&ctx, item, &signals).run().await;
                    ledger.object_finished(&run_id, &result).await;
                    result
                }
                .in_current_span(),
            );
            task_index.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    if let Some(&index) = task_index.get(&id) {
                        slots[index] = Some(result);
                    }
                }
                Err(e) => {
                    let Some(&index) = task_index.get(&e.id()) else {
                        continue;
                    };
                    warn!(object = %items[index].qualified_name(), error = %e, "object pipeline panicked");
                    let result = MigrationObjectResult::internal_failure(
                        &items[index],
                        format!("pipeline task failed: {e}"),
                    );
                    self.ledger.object_finished(&self.run_id, &result).await;
                    slots[index] = Some(result);
                }
            }
        }

        let mut results = Vec::with_capacity(items.len());
        for (item, slot) in items.iter().zip(slots) {
            let result = match slot {
                Some(result) => result,
                None => {
                    let result = MigrationObjectResult::skipped(item, self.signals.skip_reason());
                    self.ledger.object_finished(&self.run_id, &result).await;
                    result
                }
            };
            results.push(result);
        }
        results
    }

    async fn finalize(
        &mut self,
        started_at: chrono::DateTime<Utc>,
        results: Vec<MigrationObjectResult>,
    ) -> Result<MigrationRun> {
        let totals = RunTotals::from_results(&results);
        self.ledger
            .log(
                &self.run_id,
                if totals.failed > 0 { LogLevel::Warn } else { LogLevel::Info },
                format!(
                    "run finished: {} succeeded, {} failed, {} skipped",
                    totals.succeeded, totals.failed, totals.skipped
                ),
            )
            .await;

        let sealed = self.ledger.seal(&self.run_id).await.ok_or_else(|| {
            EngineError::Internal(format!("run {} vanished before finalization", self.run_id))
        })?;

        let error_log = match (&self.artifacts, totals.failed) {
            (Some(store), failed) if failed > 0 => self.write_error_report(store.as_ref(), &results).await,
            _ => None,
        };

        let run = MigrationRun {
            run_id: self.run_id.clone(),
            job_id: self.job_id.clone(),
            inventory_ref: self.request.inventory_ref.clone(),
            source_dialect: self.request.inventory.source_type,
            target_catalog: self.request.target_catalog.clone(),
            target_schema: self.request.target_schema.clone(),
            dry_run: self.request.dry_run,
            status: sealed.status,
            started_at,
            finished_at: Some(Utc::now()),
            results,
            totals,
            abort_reason: sealed.abort_reason,
            error_log,
            log: sealed.log,
        };

        let mut execution = self.execution.clone();
        execution.outcome = ExecutionOutcome::Finished {
            status: run.status,
            totals,
        };
        let on_recorded = self.on_recorded.take();
        self.ledger
            .record_with(run.clone(), execution, move || {
                if let Some(hook) = on_recorded {
                    hook();
                }
            })
            .await?;

        info!(
            run_id = %self.run_id,
            status = %run.status,
            succeeded = totals.succeeded,
            failed = totals.failed,
            skipped = totals.skipped,
            "run finalized"
        );
        Ok(run)
    }

    async fn write_error_report(
        &self,
        store: &dyn ArtifactStore,
        results: &[MigrationObjectResult],
    ) -> Option<ArtifactHandle> {
        let report = ErrorReport::from_results(
            &self.run_id,
            self.request.inventory.source_type,
            &self.request.target_catalog,
            &self.request.target_schema,
            results,
        )?;
        match report.write(store).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "failed to write error report");
                None
            }
        }
    }
}
