use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::{Execution, ExecutionFilter, LedgerStore, MigrationRun};
use crate::error::{EngineError, Result};
use crate::types::{ExecutionId, JobId, RunId};

/// SQLite-backed ledger using bundled SQLite.
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub async fn new(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
                .await
                .map_err(|e: rusqlite::Error| EngineError::Storage(e.to_string()))?
        } else {
            Connection::open(path)
                .await
                .map_err(|e: rusqlite::Error| EngineError::Storage(e.to_string()))?
        };

        let store = SqliteLedgerStore { conn };
        store.initialize().await?;
        Ok(store)
    }
}

/// Raw execution row; decoded outside the connection thread.
struct ExecutionRow {
    execution_id: String,
    job_id: Option<String>,
    run_id: Option<String>,
    triggered_by: String,
    outcome: String,
    timestamp: String,
    integrity_hash: Option<String>,
}

impl ExecutionRow {
    fn decode(self) -> Result<Execution> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| EngineError::Storage(format!("bad execution timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Execution {
            execution_id: ExecutionId(self.execution_id),
            job_id: self.job_id.map(JobId),
            run_id: self.run_id.map(RunId),
            triggered_by: self
                .triggered_by
                .parse()
                .map_err(EngineError::Storage)?,
            outcome: serde_json::from_str(&self.outcome)?,
            timestamp,
            integrity_hash: self.integrity_hash,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn initialize(&self) -> Result<()> {
        self.conn
            .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA busy_timeout = 5000;
                    ",
                )?;

                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS runs (
                        run_id TEXT PRIMARY KEY,
                        job_id TEXT,
                        status TEXT NOT NULL,
                        started_at TEXT NOT NULL,
                        finished_at TEXT,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS executions (
                        seq INTEGER PRIMARY KEY AUTOINCREMENT,
                        execution_id TEXT NOT NULL UNIQUE,
                        job_id TEXT,
                        run_id TEXT,
                        triggered_by TEXT NOT NULL,
                        outcome TEXT NOT NULL,
                        timestamp TEXT NOT NULL,
                        integrity_hash TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_runs_job_id ON runs(job_id);
                    CREATE INDEX IF NOT EXISTS idx_executions_job_id ON executions(job_id);
                    CREATE INDEX IF NOT EXISTS idx_executions_timestamp ON executions(timestamp);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| EngineError::Storage(e.to_string()))
    }

    async fn put_run(&self, run: &MigrationRun) -> Result<()> {
        let data = serde_json::to_string(run)?;
        let run_id = run.run_id.to_string();
        let job_id = run.job_id.as_ref().map(|j| j.to_string());
        let status = run.status.to_string();
        let started_at = run.started_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let finished_at = run
            .finished_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true));

        self.conn
            .call(move |conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO runs (run_id, job_id, status, started_at, finished_at, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![run_id, job_id, status, started_at, finished_at, data],
                )?;
                Ok(())
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| EngineError::Storage(e.to_string()))
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
        let run_id = run_id.to_string();

        let data = self
            .conn
            .call(move |conn| -> std::result::Result<Option<String>, rusqlite::Error> {
                let mut stmt = conn.prepare("SELECT data FROM runs WHERE run_id = ?1")?;
                let result = stmt
                    .query_row(rusqlite::params![run_id], |row| row.get::<_, String>(0))
                    .optional()?;
                Ok(result)
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| EngineError::Storage(e.to_string()))?;

        data.map(|d| serde_json::from_str(&d).map_err(EngineError::from))
            .transpose()
    }

    async fn append_execution(&self, execution: &Execution) -> Result<()> {
        let outcome = serde_json::to_string(&execution.outcome)?;
        let execution_id = execution.execution_id.to_string();
        let job_id = execution.job_id.as_ref().map(|j| j.to_string());
        let run_id = execution.run_id.as_ref().map(|r| r.to_string());
        let triggered_by = execution.triggered_by.to_string();
        let timestamp = execution.timestamp_text();
        let integrity_hash = execution.integrity_hash.clone();

        self.conn
            .call(move |conn| -> std::result::Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO executions (execution_id, job_id, run_id, triggered_by, outcome, timestamp, integrity_hash) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        execution_id,
                        job_id,
                        run_id,
                        triggered_by,
                        outcome,
                        timestamp,
                        integrity_hash,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| EngineError::Storage(e.to_string()))
    }

    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let filter = filter.clone();

        let rows = self
            .conn
            .call(move |conn| -> std::result::Result<Vec<ExecutionRow>, rusqlite::Error> {
                let mut sql = "SELECT execution_id, job_id, run_id, triggered_by, outcome, timestamp, integrity_hash FROM executions WHERE 1=1".to_string();
                let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

                if let Some(ref job_id) = filter.job_id {
                    sql.push_str(&format!(" AND job_id = ?{}", params.len() + 1));
                    params.push(Box::new(job_id.to_string()));
                }
                if let Some(triggered_by) = filter.triggered_by {
                    sql.push_str(&format!(" AND triggered_by = ?{}", params.len() + 1));
                    params.push(Box::new(triggered_by.to_string()));
                }
                if let Some(since) = filter.since {
                    sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
                    params.push(Box::new(since.to_rfc3339_opts(SecondsFormat::Micros, true)));
                }

                sql.push_str(" ORDER BY seq DESC");

                if let Some(limit) = filter.limit {
                    sql.push_str(&format!(" LIMIT ?{}", params.len() + 1));
                    params.push(Box::new(limit as i64));
                }

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let rows = stmt.query_map(param_refs.as_slice(), |row| {
                    Ok(ExecutionRow {
                        execution_id: row.get(0)?,
                        job_id: row.get(1)?,
                        run_id: row.get(2)?,
                        triggered_by: row.get(3)?,
                        outcome: row.get(4)?,
                        timestamp: row.get(5)?,
                        integrity_hash: row.get(6)?,
                    })
                })?;

                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                Ok(entries)
            })
            .await
            .map_err(|e: tokio_rusqlite::Error| EngineError::Storage(e.to_string()))?;

        rows.into_iter().map(ExecutionRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactHandle;
    use crate::ledger::{ExecutionOutcome, RunTotals};
    use crate::types::{RunStatus, SourceDialect, TriggeredBy};

    fn run(run_id: &str) -> MigrationRun {
        MigrationRun {
            run_id: RunId::from(run_id),
            job_id: Some(JobId::from("nightly")),
            inventory_ref: ArtifactHandle::from("inventories/a/inventory.json"),
            source_dialect: SourceDialect::Snowflake,
            target_catalog: "main".into(),
            target_schema: "edw".into(),
            dry_run: false,
            status: RunStatus::Completed,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            results: vec![],
            totals: RunTotals::default(),
            abort_reason: None,
            error_log: None,
            log: vec![],
        }
    }

    #[tokio::test]
    async fn test_put_get_run() {
        let store = SqliteLedgerStore::new(":memory:").await.unwrap();
        let r = run("run-1");
        store.put_run(&r).await.unwrap();
        assert_eq!(store.get_run(&RunId::from("run-1")).await.unwrap(), Some(r));
        assert_eq!(store.get_run(&RunId::from("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_runs_are_written_once() {
        let store = SqliteLedgerStore::new(":memory:").await.unwrap();
        store.put_run(&run("run-1")).await.unwrap();
        assert!(store.put_run(&run("run-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_query_executions_filters() {
        let store = SqliteLedgerStore::new(":memory:").await.unwrap();
        let scheduled = Execution::dispatched(
            Some(JobId::from("nightly")),
            RunId::from("run-1"),
            TriggeredBy::Scheduled,
        );
        let manual = Execution::rejected(None, TriggeredBy::Manual, "not_found", "no job");
        store.append_execution(&scheduled).await.unwrap();
        store.append_execution(&manual).await.unwrap();

        let all = store.query_executions(&ExecutionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].execution_id, manual.execution_id);
        assert_eq!(all[1], scheduled_roundtrip(&scheduled));

        let by_job = store
            .query_executions(&ExecutionFilter {
                job_id: Some(JobId::from("nightly")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_job.len(), 1);
        assert_eq!(by_job[0].outcome, ExecutionOutcome::Dispatched);

        let by_trigger = store
            .query_executions(&ExecutionFilter {
                triggered_by: Some(TriggeredBy::Manual),
                limit: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_trigger.len(), 1);
        assert!(by_trigger[0].run_id.is_none());
    }

    /// Stored timestamps keep microsecond precision.
    fn scheduled_roundtrip(exec: &Execution) -> Execution {
        let mut expected = exec.clone();
        expected.timestamp = DateTime::parse_from_rfc3339(&exec.timestamp_text())
            .unwrap()
            .with_timezone(&Utc);
        expected
    }

    #[tokio::test]
    async fn test_file_backed_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let store = SqliteLedgerStore::new(path.to_str().unwrap()).await.unwrap();
        let mode: String = store
            .conn
            .call(|conn| -> std::result::Result<String, rusqlite::Error> {
                let mut stmt = conn.prepare("PRAGMA journal_mode")?;
                let mode: String = stmt.query_row([], |row| row.get(0))?;
                Ok(mode)
            })
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
