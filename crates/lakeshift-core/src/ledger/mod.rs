//! Job/execution ledger: durable runs and executions plus live run progress.

pub mod model;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use model::{
    Execution, ExecutionOutcome, LogLevel, MigrationRun, RunLogEntry, RunProgress, RunTotals,
};
pub use sqlite::SqliteLedgerStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{CancelError, EngineError, Result};
use crate::pipeline::{MigrationObjectResult, RunSignals};
use crate::types::{ExecutionId, JobId, RunId, RunStatus, TriggeredBy};

/// Filter for querying executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub job_id: Option<JobId>,
    pub triggered_by: Option<TriggeredBy>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Trait for pluggable ledger storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create tables if needed.
    async fn initialize(&self) -> Result<()>;

    /// Store a finalized run. Runs are written once.
    async fn put_run(&self, run: &MigrationRun) -> Result<()>;

    async fn get_run(&self, run_id: &RunId) -> Result<Option<MigrationRun>>;

    /// Append an execution row (its integrity hash already set).
    async fn append_execution(&self, execution: &Execution) -> Result<()>;

    /// Executions matching `filter`, most recently appended first.
    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;
}

/// Result of walking the execution hash chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: usize,
    /// First row whose stored hash does not match its recomputed hash.
    pub first_broken: Option<ExecutionId>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

/// What the coordinator needs from a run once it is sealed.
#[derive(Debug)]
pub struct SealedRun {
    pub status: RunStatus,
    pub abort_reason: Option<String>,
    pub log: Vec<RunLogEntry>,
}

struct LiveRun {
    progress: RunProgress,
    signals: RunSignals,
    sealed: bool,
    started: Instant,
    log: VecDeque<RunLogEntry>,
    done: watch::Sender<bool>,
    unrecorded: Option<Unrecorded>,
}

/// A finalized run whose storage write failed. Held until a retry succeeds.
struct Unrecorded {
    run: MigrationRun,
    execution: Execution,
    run_stored: bool,
}

pub struct Ledger {
    store: Box<dyn LedgerStore>,
    live: Mutex<HashMap<RunId, LiveRun>>,
    append_lock: Mutex<()>,
    log_capacity: usize,
}

impl Ledger {
    pub async fn open(store: Box<dyn LedgerStore>, log_capacity: usize) -> Result<Self> {
        store.initialize().await?;
        Ok(Ledger {
            store,
            live: Mutex::new(HashMap::new()),
            append_lock: Mutex::new(()),
            log_capacity,
        })
    }

    /// A ledger over SQLite at `path` (`:memory:` for a volatile one).
    pub async fn sqlite(path: &str, log_capacity: usize) -> Result<Self> {
        let store = SqliteLedgerStore::new(path).await?;
        Self::open(Box::new(store), log_capacity).await
    }

    /// Register an in-flight run.
    pub async fn begin(&self, run_id: &RunId, total: usize, signals: RunSignals) -> Result<()> {
        let mut live = self.live.lock().await;
        if live.contains_key(run_id) {
            return Err(EngineError::InvalidArgument(format!(
                "run {run_id} is already in flight"
            )));
        }
        let (done, _) = watch::channel(false);
        live.insert(
            run_id.clone(),
            LiveRun {
                progress: RunProgress {
                    run_id: run_id.clone(),
                    status: RunStatus::Running,
                    total,
                    completed: 0,
                    succeeded: 0,
                    failed: 0,
                    skipped: 0,
                    current_object: None,
                    percent: if total == 0 { 100.0 } else { 0.0 },
                    eta_secs: None,
                },
                signals,
                sealed: false,
                started: Instant::now(),
                log: VecDeque::new(),
                done,
                unrecorded: None,
            },
        );
        Ok(())
    }

    pub async fn is_live(&self, run_id: &RunId) -> bool {
        self.live.lock().await.contains_key(run_id)
    }

    pub async fn object_started(&self, run_id: &RunId, object_name: &str) {
        if let Some(run) = self.live.lock().await.get_mut(run_id) {
            run.progress.current_object = Some(object_name.to_string());
        }
    }

    pub async fn object_finished(&self, run_id: &RunId, result: &MigrationObjectResult) {
        let mut live = self.live.lock().await;
        let Some(run) = live.get_mut(run_id) else {
            return;
        };
        let mut totals = RunTotals {
            succeeded: run.progress.succeeded,
            failed: run.progress.failed,
            skipped: run.progress.skipped,
        };
        totals.add(result.status);
        run.progress.succeeded = totals.succeeded;
        run.progress.failed = totals.failed;
        run.progress.skipped = totals.skipped;
        run.progress.completed = totals.total();
        if run.progress.current_object.as_deref() == Some(result.object_name.as_str()) {
            run.progress.current_object = None;
        }

        let (level, message) = match (&result.error_message, result.skip_reason) {
            (Some(err), _) => (
                LogLevel::Error,
                format!("{} failed: {}", result.object_name, err),
            ),
            (None, Some(reason)) => (
                LogLevel::Warn,
                format!("{} skipped: {}", result.object_name, reason),
            ),
            (None, None) => (
                LogLevel::Info,
                format!("{} migrated", result.object_name),
            ),
        };
        push_log(&mut run.log, self.log_capacity, level, message);
    }

    /// Append a line to a live run's log.
    pub async fn log(&self, run_id: &RunId, level: LogLevel, message: impl Into<String>) {
        if let Some(run) = self.live.lock().await.get_mut(run_id) {
            push_log(&mut run.log, self.log_capacity, level, message.into());
        }
    }

    /// Close a run to cancellation and fix its final status.
    ///
    /// After sealing, `cancel` reports `AlreadyFinished`.
    pub async fn seal(&self, run_id: &RunId) -> Option<SealedRun> {
        let mut live = self.live.lock().await;
        let run = live.get_mut(run_id)?;
        run.sealed = true;
        let status = if run.signals.abort_reason().is_some() {
            RunStatus::Aborted
        } else if run.signals.is_cancel_requested() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        run.progress.status = status;
        run.progress.current_object = None;
        Some(SealedRun {
            status,
            abort_reason: run.signals.abort_reason().map(str::to_string),
            log: run.log.iter().cloned().collect(),
        })
    }

    /// Persist a finalized run and its execution, then release waiters.
    ///
    /// If storage fails, the run stays sealed in memory with its final record
    /// so `get` and `progress` still serve it, and the error is returned.
    /// `retry_unrecorded` writes it later.
    pub async fn record(&self, run: MigrationRun, execution: Execution) -> Result<Execution> {
        self.record_with(run, execution, || {}).await
    }

    /// Like `record`, running `before_wake` after the write attempt and
    /// before any `await_finished` caller is released.
    pub async fn record_with<F>(
        &self,
        run: MigrationRun,
        execution: Execution,
        before_wake: F,
    ) -> Result<Execution>
    where
        F: FnOnce() + Send,
    {
        let run_id = run.run_id.clone();
        match self.persist(&run, execution.clone(), false).await {
            Ok(stored) => {
                let live = self.live.lock().await.remove(&run_id);
                before_wake();
                if let Some(live) = live {
                    let _ = live.done.send(true);
                }
                info!(run_id = %run_id, status = %run.status, "run recorded");
                Ok(stored)
            }
            Err((e, run_stored)) => {
                error!(run_id = %run_id, error = %e, "failed to record run; kept in memory for retry");
                before_wake();
                let mut live = self.live.lock().await;
                if let Some(entry) = live.get_mut(&run_id) {
                    entry.sealed = true;
                    entry.progress = RunProgress::from_run(&run);
                    entry.unrecorded = Some(Unrecorded {
                        run,
                        execution,
                        run_stored,
                    });
                    let _ = entry.done.send(true);
                }
                Err(e)
            }
        }
    }

    /// Retry storage writes for runs that failed to record.
    ///
    /// Returns how many were written. Runs that fail again stay pending and
    /// the first error is returned after every pending run was tried.
    pub async fn retry_unrecorded(&self) -> Result<usize> {
        let pending: Vec<(MigrationRun, Execution, bool)> = self
            .live
            .lock()
            .await
            .values()
            .filter_map(|live| live.unrecorded.as_ref())
            .map(|u| (u.run.clone(), u.execution.clone(), u.run_stored))
            .collect();

        let mut written = 0;
        let mut first_error = None;
        for (run, execution, run_stored) in pending {
            match self.persist(&run, execution, run_stored).await {
                Ok(_) => {
                    self.live.lock().await.remove(&run.run_id);
                    info!(run_id = %run.run_id, "pending run recorded");
                    written += 1;
                }
                Err((e, run_stored)) => {
                    warn!(run_id = %run.run_id, error = %e, "pending run still unrecorded");
                    if let Some(u) = self
                        .live
                        .lock()
                        .await
                        .get_mut(&run.run_id)
                        .and_then(|live| live.unrecorded.as_mut())
                    {
                        u.run_stored = run_stored;
                    }
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Runs that are finalized but not yet in storage.
    pub async fn unrecorded_runs(&self) -> Vec<RunId> {
        self.live
            .lock()
            .await
            .iter()
            .filter(|(_, live)| live.unrecorded.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Write the run row (unless already written), then the execution row.
    /// On failure, also reports whether the run row is in storage.
    async fn persist(
        &self,
        run: &MigrationRun,
        execution: Execution,
        run_stored: bool,
    ) -> std::result::Result<Execution, (EngineError, bool)> {
        if !run_stored {
            self.store.put_run(run).await.map_err(|e| (e, false))?;
        }
        self.append_execution(execution).await.map_err(|e| (e, true))
    }

    fn pending_run(live: &HashMap<RunId, LiveRun>, run_id: &RunId) -> Option<MigrationRun> {
        live.get(run_id)
            .and_then(|entry| entry.unrecorded.as_ref())
            .map(|u| u.run.clone())
    }

    /// Append an execution row, chaining its hash to the latest row.
    pub async fn append_execution(&self, mut execution: Execution) -> Result<Execution> {
        let _guard = self.append_lock.lock().await;
        let latest = self
            .store
            .query_executions(&ExecutionFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        let prev = latest.first().and_then(|e| e.integrity_hash.clone());
        execution.integrity_hash = Some(execution.compute_hash(prev.as_deref())?);
        self.store.append_execution(&execution).await?;
        debug!(execution_id = %execution.execution_id, "execution appended");
        Ok(execution)
    }

    pub async fn get(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
        if let Some(run) = Self::pending_run(&*self.live.lock().await, run_id) {
            return Ok(Some(run));
        }
        self.store.get_run(run_id).await
    }

    pub async fn list_executions(
        &self,
        job_id: Option<&JobId>,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        self.store
            .query_executions(&ExecutionFilter {
                job_id: job_id.cloned(),
                limit: Some(limit),
                ..Default::default()
            })
            .await
    }

    pub async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        self.store.query_executions(filter).await
    }

    pub async fn progress(&self, run_id: &RunId) -> Result<Option<RunProgress>> {
        {
            let live = self.live.lock().await;
            if let Some(run) = live.get(run_id) {
                if run.unrecorded.is_some() {
                    return Ok(Some(run.progress.clone()));
                }
                let mut progress = run.progress.clone();
                let remaining = progress.total.saturating_sub(progress.completed);
                if progress.total > 0 {
                    progress.percent =
                        (progress.completed as f64 / progress.total as f64 * 1000.0).round() / 10.0;
                }
                if progress.completed > 0 {
                    let per_object = run.started.elapsed().as_secs_f64() / progress.completed as f64;
                    progress.eta_secs = Some((per_object * remaining as f64).ceil() as u64);
                }
                return Ok(Some(progress));
            }
        }
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .map(|run| RunProgress::from_run(&run)))
    }

    /// Wait until `run_id` is finalized, then return the stored run.
    pub async fn await_finished(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
        let receiver = self
            .live
            .lock()
            .await
            .get(run_id)
            .map(|run| run.done.subscribe());
        if let Some(mut rx) = receiver {
            // A closed channel means the live entry was dropped: finalized.
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get(run_id).await
    }

    /// Request cooperative cancellation of an in-flight run.
    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        {
            let live = self.live.lock().await;
            if let Some(run) = live.get(run_id) {
                if run.sealed {
                    return Err(CancelError::AlreadyFinished(run_id.clone()).into());
                }
                run.signals.cancel();
                info!(run_id = %run_id, "run cancellation requested");
                return Ok(());
            }
        }
        if self.store.get_run(run_id).await?.is_some() {
            Err(CancelError::AlreadyFinished(run_id.clone()).into())
        } else {
            Err(CancelError::NotFound(run_id.clone()).into())
        }
    }

    /// Recompute every execution hash in append order.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let _guard = self.append_lock.lock().await;
        let mut rows = self
            .store
            .query_executions(&ExecutionFilter::default())
            .await?;
        rows.reverse();

        let mut prev: Option<String> = None;
        for (i, row) in rows.iter().enumerate() {
            let expected = row.compute_hash(prev.as_deref())?;
            if row.integrity_hash.as_deref() != Some(expected.as_str()) {
                warn!(execution_id = %row.execution_id, "execution hash chain broken");
                return Ok(IntegrityReport {
                    checked: i + 1,
                    first_broken: Some(row.execution_id.clone()),
                });
            }
            prev = row.integrity_hash.clone();
        }
        Ok(IntegrityReport {
            checked: rows.len(),
            first_broken: None,
        })
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }
}

fn push_log(log: &mut VecDeque<RunLogEntry>, capacity: usize, level: LogLevel, message: String) {
    if capacity == 0 {
        return;
    }
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(RunLogEntry {
        timestamp: Utc::now(),
        level,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactHandle;
    use crate::types::{ObjectStatus, ObjectType, SourceDialect};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn ledger() -> Ledger {
        Ledger::sqlite(":memory:", 3).await.unwrap()
    }

    /// SQLite store whose writes can be switched off.
    struct FailingWrites {
        inner: SqliteLedgerStore,
        fail_runs: Arc<AtomicBool>,
        fail_executions: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LedgerStore for FailingWrites {
        async fn initialize(&self) -> Result<()> {
            self.inner.initialize().await
        }

        async fn put_run(&self, run: &MigrationRun) -> Result<()> {
            if self.fail_runs.load(Ordering::SeqCst) {
                return Err(EngineError::Internal("disk full".into()));
            }
            self.inner.put_run(run).await
        }

        async fn get_run(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
            self.inner.get_run(run_id).await
        }

        async fn append_execution(&self, execution: &Execution) -> Result<()> {
            if self.fail_executions.load(Ordering::SeqCst) {
                return Err(EngineError::Internal("disk full".into()));
            }
            self.inner.append_execution(execution).await
        }

        async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
            self.inner.query_executions(filter).await
        }
    }

    async fn failing_ledger() -> (Ledger, Arc<AtomicBool>, Arc<AtomicBool>) {
        let fail_runs = Arc::new(AtomicBool::new(false));
        let fail_executions = Arc::new(AtomicBool::new(false));
        let store = FailingWrites {
            inner: SqliteLedgerStore::new(":memory:").await.unwrap(),
            fail_runs: fail_runs.clone(),
            fail_executions: fail_executions.clone(),
        };
        let ledger = Ledger::open(Box::new(store), 10).await.unwrap();
        (ledger, fail_runs, fail_executions)
    }

    fn result(name: &str, status: ObjectStatus) -> MigrationObjectResult {
        MigrationObjectResult {
            object_name: name.into(),
            object_type: ObjectType::Table,
            source_sql: "CREATE TABLE t (a INT)".into(),
            target_sql: None,
            status,
            error_message: (status == ObjectStatus::Error).then(|| "boom".to_string()),
            error_kind: None,
            skip_reason: None,
            execution_time_ms: Some(5),
        }
    }

    fn finished_run(run_id: &RunId, sealed: SealedRun, results: Vec<MigrationObjectResult>) -> MigrationRun {
        MigrationRun {
            run_id: run_id.clone(),
            job_id: None,
            inventory_ref: ArtifactHandle::from("inventories/x/inventory.json"),
            source_dialect: SourceDialect::Oracle,
            target_catalog: "main".into(),
            target_schema: "sales".into(),
            dry_run: true,
            status: sealed.status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            totals: RunTotals::from_results(&results),
            results,
            abort_reason: sealed.abort_reason,
            error_log: None,
            log: sealed.log,
        }
    }

    #[tokio::test]
    async fn test_progress_then_record() {
        let ledger = ledger().await;
        let run_id = RunId::generate();
        ledger.begin(&run_id, 2, RunSignals::new()).await.unwrap();

        ledger.object_started(&run_id, "s.a").await;
        let p = ledger.progress(&run_id).await.unwrap().unwrap();
        assert_eq!(p.current_object.as_deref(), Some("s.a"));
        assert_eq!(p.status, RunStatus::Running);

        let a = result("s.a", ObjectStatus::Success);
        ledger.object_finished(&run_id, &a).await;
        let p = ledger.progress(&run_id).await.unwrap().unwrap();
        assert_eq!((p.completed, p.succeeded), (1, 1));
        assert_eq!(p.percent, 50.0);
        assert!(p.eta_secs.is_some());

        let b = result("s.b", ObjectStatus::Error);
        ledger.object_finished(&run_id, &b).await;

        let sealed = ledger.seal(&run_id).await.unwrap();
        assert_eq!(sealed.status, RunStatus::Completed);
        assert_eq!(sealed.log.len(), 2);

        let exec = Execution::dispatched(None, run_id.clone(), TriggeredBy::Manual);
        let run = finished_run(&run_id, sealed, vec![a, b]);
        let stored = ledger.record(run.clone(), exec).await.unwrap();
        assert!(stored.integrity_hash.is_some());

        assert!(!ledger.is_live(&run_id).await);
        assert_eq!(ledger.get(&run_id).await.unwrap(), Some(run));
        let p = ledger.progress(&run_id).await.unwrap().unwrap();
        assert_eq!((p.total, p.failed, p.percent), (2, 1, 100.0));
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let ledger = ledger().await;
        let run_id = RunId::generate();
        ledger.begin(&run_id, 0, RunSignals::new()).await.unwrap();
        for i in 0..5 {
            ledger.log(&run_id, LogLevel::Info, format!("line {i}")).await;
        }
        let sealed = ledger.seal(&run_id).await.unwrap();
        let lines: Vec<&str> = sealed.log.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_cancel_lifecycle() {
        let ledger = ledger().await;
        let run_id = RunId::generate();
        let signals = RunSignals::new();

        let err = ledger.cancel(&run_id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        ledger.begin(&run_id, 1, signals.clone()).await.unwrap();
        ledger.cancel(&run_id).await.unwrap();
        assert!(signals.is_cancel_requested());

        let sealed = ledger.seal(&run_id).await.unwrap();
        assert_eq!(sealed.status, RunStatus::Cancelled);
        let err = ledger.cancel(&run_id).await.unwrap_err();
        assert_eq!(err.kind(), "already_finished");

        let exec = Execution::dispatched(None, run_id.clone(), TriggeredBy::Manual);
        ledger
            .record(finished_run(&run_id, sealed, vec![]), exec)
            .await
            .unwrap();
        let before = ledger.get(&run_id).await.unwrap();
        let err = ledger.cancel(&run_id).await.unwrap_err();
        assert_eq!(err.kind(), "already_finished");
        assert_eq!(ledger.get(&run_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_await_finished_wakes_on_record() {
        let ledger = Arc::new(ledger().await);
        let run_id = RunId::generate();
        ledger.begin(&run_id, 0, RunSignals::new()).await.unwrap();

        let waiter = {
            let ledger = ledger.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move { ledger.await_finished(&run_id).await })
        };

        let sealed = ledger.seal(&run_id).await.unwrap();
        let exec = Execution::dispatched(None, run_id.clone(), TriggeredBy::Manual);
        ledger
            .record(finished_run(&run_id, sealed, vec![]), exec)
            .await
            .unwrap();

        let run = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(run.run_id, run_id);
    }

    #[tokio::test]
    async fn test_hash_chain_verifies() {
        let ledger = ledger().await;
        let job = JobId::from("job-1");
        for i in 0..3 {
            ledger
                .append_execution(Execution::rejected(
                    Some(job.clone()),
                    TriggeredBy::Scheduled,
                    "inventory_unavailable",
                    format!("attempt {i}"),
                ))
                .await
                .unwrap();
        }
        let report = ledger.verify_integrity().await.unwrap();
        assert_eq!(report.checked, 3);
        assert!(report.is_intact());

        let history = ledger.list_executions(Some(&job), 2).await.unwrap();
        assert_eq!(history.len(), 2);
        match &history[0].outcome {
            ExecutionOutcome::Rejected { message, .. } => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tampered_row_breaks_chain() {
        let ledger = ledger().await;
        let first = ledger
            .append_execution(Execution::rejected(None, TriggeredBy::Manual, "x", "one"))
            .await
            .unwrap();
        let mut forged = Execution::rejected(None, TriggeredBy::Manual, "x", "two");
        forged.integrity_hash = Some("0".repeat(64));
        ledger.store().append_execution(&forged).await.unwrap();

        let report = ledger.verify_integrity().await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.first_broken, Some(forged.execution_id.clone()));
        assert_ne!(first.execution_id, forged.execution_id);
    }

    #[tokio::test]
    async fn test_failed_record_keeps_run_until_retried() {
        let (ledger, fail_runs, _) = failing_ledger().await;
        let run_id = RunId::generate();
        ledger.begin(&run_id, 1, RunSignals::new()).await.unwrap();
        let a = result("s.a", ObjectStatus::Success);
        ledger.object_finished(&run_id, &a).await;
        let sealed = ledger.seal(&run_id).await.unwrap();
        let run = finished_run(&run_id, sealed, vec![a]);
        let exec = Execution::dispatched(None, run_id.clone(), TriggeredBy::Manual);

        fail_runs.store(true, Ordering::SeqCst);
        let err = ledger.record(run.clone(), exec.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "internal");

        assert_eq!(ledger.get(&run_id).await.unwrap(), Some(run.clone()));
        assert_eq!(ledger.await_finished(&run_id).await.unwrap(), Some(run.clone()));
        let p = ledger.progress(&run_id).await.unwrap().unwrap();
        assert_eq!((p.status, p.completed, p.percent), (RunStatus::Completed, 1, 100.0));
        let err = ledger.cancel(&run_id).await.unwrap_err();
        assert_eq!(err.kind(), "already_finished");
        assert_eq!(ledger.unrecorded_runs().await, vec![run_id.clone()]);
        assert!(ledger.retry_unrecorded().await.is_err());
        assert!(ledger.list_executions(None, 10).await.unwrap().is_empty());

        fail_runs.store(false, Ordering::SeqCst);
        assert_eq!(ledger.retry_unrecorded().await.unwrap(), 1);
        assert!(!ledger.is_live(&run_id).await);
        assert_eq!(ledger.store().get_run(&run_id).await.unwrap(), Some(run));
        let history = ledger.list_executions(None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].execution_id, exec.execution_id);
        assert!(ledger.verify_integrity().await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_retry_skips_run_row_already_written() {
        let (ledger, _, fail_executions) = failing_ledger().await;
        let run_id = RunId::generate();
        ledger.begin(&run_id, 0, RunSignals::new()).await.unwrap();
        let sealed = ledger.seal(&run_id).await.unwrap();
        let exec = Execution::dispatched(None, run_id.clone(), TriggeredBy::Scheduled);

        fail_executions.store(true, Ordering::SeqCst);
        ledger
            .record(finished_run(&run_id, sealed, vec![]), exec)
            .await
            .unwrap_err();
        assert!(ledger.store().get_run(&run_id).await.unwrap().is_some());

        fail_executions.store(false, Ordering::SeqCst);
        assert_eq!(ledger.retry_unrecorded().await.unwrap(), 1);
        assert_eq!(ledger.list_executions(None, 10).await.unwrap().len(), 1);
        assert!(ledger.unrecorded_runs().await.is_empty());
    }
}
