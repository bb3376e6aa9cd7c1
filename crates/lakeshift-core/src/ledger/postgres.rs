use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::error;

use super::{Execution, ExecutionFilter, LedgerStore, MigrationRun};
use crate::error::{EngineError, Result};
use crate::types::{ExecutionId, JobId, RunId};

/// PostgreSQL-backed ledger.
///
/// `tokio_postgres::Client` pipelines requests over one connection and its
/// methods take `&self`, so it is shared through an `Arc` without a mutex.
///
/// Enable with the `postgres` Cargo feature.
pub struct PostgresLedgerStore {
    client: Arc<Client>,
}

impl PostgresLedgerStore {
    /// Connect using a libpq-style string, e.g. `"host=localhost user=postgres dbname=lakeshift"`.
    pub async fn new(connection_str: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(connection_str, NoTls)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "ledger postgres connection error");
            }
        });

        let store = PostgresLedgerStore {
            client: Arc::new(client),
        };
        store.initialize().await?;
        Ok(store)
    }
}

fn storage_err(e: tokio_postgres::Error) -> EngineError {
    EngineError::Storage(e.to_string())
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn initialize(&self) -> Result<()> {
        self.client
            .batch_execute(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    run_id      TEXT        PRIMARY KEY,
                    job_id      TEXT,
                    status      TEXT        NOT NULL,
                    started_at  TEXT        NOT NULL,
                    finished_at TEXT,
                    data        TEXT        NOT NULL
                );

                CREATE TABLE IF NOT EXISTS executions (
                    seq            BIGSERIAL   PRIMARY KEY,
                    execution_id   TEXT        NOT NULL UNIQUE,
                    job_id         TEXT,
                    run_id         TEXT,
                    triggered_by   TEXT        NOT NULL,
                    outcome        TEXT        NOT NULL,
                    timestamp      TEXT        NOT NULL,
                    integrity_hash TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_runs_job_id          ON runs(job_id);
                CREATE INDEX IF NOT EXISTS idx_executions_job_id    ON executions(job_id);
                CREATE INDEX IF NOT EXISTS idx_executions_timestamp ON executions(timestamp);
                ",
            )
            .await
            .map_err(storage_err)
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
        self.client
            .execute(
                "INSERT INTO runs (run_id, job_id, status, started_at, finished_at, data)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[&run_id, &job_id, &status, &started_at, &finished_at, &data],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
        let rows = self
            .client
            .query("SELECT data FROM runs WHERE run_id = $1", &[&run_id.as_str()])
            .await
            .map_err(storage_err)?;
        rows.first()
            .map(|row| serde_json::from_str(&row.get::<_, String>(0)).map_err(EngineError::from))
            .transpose()
    }

    async fn append_execution(&self, execution: &Execution) -> Result<()> {
        let outcome = serde_json::to_string(&execution.outcome)?;
        let job_id = execution.job_id.as_ref().map(|j| j.to_string());
        let run_id = execution.run_id.as_ref().map(|r| r.to_string());
        let triggered_by = execution.triggered_by.to_string();
        let timestamp = execution.timestamp_text();
        self.client
            .execute(
                "INSERT INTO executions (execution_id, job_id, run_id, triggered_by, outcome, timestamp, integrity_hash)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &execution.execution_id.as_str(),
                    &job_id,
                    &run_id,
                    &triggered_by,
                    &outcome,
                    &timestamp,
                    &execution.integrity_hash,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut sql = "SELECT execution_id, job_id, run_id, triggered_by, outcome, timestamp, integrity_hash \
                       FROM executions WHERE 1=1"
            .to_string();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();

        if let Some(ref job_id) = filter.job_id {
            params.push(Box::new(job_id.to_string()));
            sql.push_str(&format!(" AND job_id = ${}", params.len()));
        }
        if let Some(triggered_by) = filter.triggered_by {
            params.push(Box::new(triggered_by.to_string()));
            sql.push_str(&format!(" AND triggered_by = ${}", params.len()));
        }
        if let Some(since) = filter.since {
            params.push(Box::new(since.to_rfc3339_opts(SecondsFormat::Micros, true)));
            sql.push_str(&format!(" AND timestamp >= ${}", params.len()));
        }
        sql.push_str(" ORDER BY seq DESC");
        if let Some(limit) = filter.limit {
            params.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }

        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(sql.as_str(), &param_refs)
            .await
            .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                let timestamp: String = row.get(5);
                let triggered_by: String = row.get(3);
                let outcome: String = row.get(4);
                Ok(Execution {
                    execution_id: ExecutionId(row.get(0)),
                    job_id: row.get::<_, Option<String>>(1).map(JobId),
                    run_id: row.get::<_, Option<String>>(2).map(RunId),
                    triggered_by: triggered_by.parse().map_err(EngineError::Storage)?,
                    outcome: serde_json::from_str(&outcome)?,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|e| EngineError::Storage(format!("bad execution timestamp: {e}")))?
                        .with_timezone(&Utc),
                    integrity_hash: row.get(6),
                })
            })
            .collect()
    }
}
