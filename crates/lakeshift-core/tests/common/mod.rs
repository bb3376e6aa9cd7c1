//! Fake collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;

use lakeshift_core::ledger::Ledger;
use lakeshift_core::{
    ArtifactHandle, ConnectError, ConnectionConfig, ConnectionId, ConnectionMethod,
    EngineConfig, ExecutionError, Inventory, InventoryItem, ObjectType, QueryError, RunId,
    RunProgress, Secret, SourceConnector, SourceDialect, SourceRow, SourceSession, TargetChange,
    TargetExecutor, TranslateError, TranslationRequest, Translator, ValidationError,
};

/// Fences the source SQL; fails on `BROKEN`. With a gate, each call waits for a permit.
#[derive(Default)]
pub struct FakeTranslator {
    pub calls: AtomicUsize,
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeTranslator {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        FakeTranslator {
            gate: Some(gate),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, req: TranslationRequest<'_>) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TranslateError::ModelUnavailable("gate closed".into()))?
                .forget();
        }
        if req.source_sql.contains("BROKEN") {
            return Err(TranslateError::InvalidOutput("model answered with prose".into()));
        }
        Ok(format!(
            "```sql\n-- target {}.{}\n{}\n```",
            req.target_catalog, req.target_schema, req.source_sql
        ))
    }
}

/// Counts calls; becomes unavailable on statements containing `UNAVAILABLE`.
#[derive(Default)]
pub struct FakeTarget {
    pub validated: AtomicUsize,
    pub executed: AtomicUsize,
}

#[async_trait]
impl TargetExecutor for FakeTarget {
    async fn validate(&self, sql: &str) -> Result<(), ValidationError> {
        self.validated.fetch_add(1, Ordering::SeqCst);
        if sql.contains("REJECT") {
            return Err(ValidationError::Rejected("unknown function".into()));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<TargetChange, ExecutionError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        if sql.contains("UNAVAILABLE") {
            return Err(ExecutionError::TargetUnavailable("warehouse is stopped".into()));
        }
        Ok(TargetChange::SchemaChange)
    }
}

impl FakeTarget {
    pub fn validated(&self) -> usize {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

pub fn table(schema: &str, name: &str, sql: &str) -> InventoryItem {
    InventoryItem {
        schema: schema.into(),
        name: name.into(),
        object_type: ObjectType::Table,
        source_definition: sql.into(),
        columns: vec![],
        row_count: None,
    }
}

pub fn inventory(items: Vec<InventoryItem>) -> Arc<Inventory> {
    Arc::new(Inventory {
        id: uuid::Uuid::new_v4().to_string(),
        connection_id: ConnectionId::from("conn-test"),
        source_type: SourceDialect::Oracle,
        source_database: "ORCL".into(),
        extracted_at: Utc::now(),
        summary: Default::default(),
        items,
        skipped_schemas: vec![],
        issues: vec![],
        fingerprint: String::new(),
    })
}

pub fn numbered_tables(count: usize) -> Vec<InventoryItem> {
    (0..count)
        .map(|i| table("SALES", &format!("T{i:02}"), &format!("CREATE TABLE SALES.T{i:02} (ID NUMBER)")))
        .collect()
}

pub fn config(max_concurrency: usize) -> EngineConfig {
    EngineConfig {
        max_concurrency,
        ledger_path: ":memory:".into(),
        ..Default::default()
    }
}

pub async fn memory_ledger() -> Arc<Ledger> {
    Arc::new(Ledger::sqlite(":memory:", 100).await.unwrap())
}

pub fn inventory_ref() -> ArtifactHandle {
    ArtifactHandle::from("inventories/test/inventory.json")
}

/// Poll until `check` accepts the run's progress.
pub async fn wait_for_progress<F>(ledger: &Ledger, run_id: &RunId, check: F) -> RunProgress
where
    F: Fn(&RunProgress) -> bool,
{
    for _ in 0..500 {
        if let Some(progress) = ledger.progress(run_id).await.unwrap() {
            if check(&progress) {
                return progress;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached the expected progress");
}

/// Answers catalog queries by substring; `NEEDLE@schema` matches only that schema bind.
#[derive(Default)]
pub struct FakeSession {
    pub answers: Vec<(&'static str, Result<Vec<SourceRow>, QueryError>)>,
}

#[async_trait]
impl SourceSession for FakeSession {
    async fn query(&self, sql: &str, binds: &[(&str, String)]) -> Result<Vec<SourceRow>, QueryError> {
        let schema = binds
            .iter()
            .find(|(name, _)| *name == "schema")
            .map(|(_, value)| value.as_str())
            .unwrap_or("");
        for (needle, answer) in &self.answers {
            let (text, only_schema) = match needle.split_once('@') {
                Some((text, only_schema)) => (text, only_schema),
                None => (*needle, ""),
            };
            if sql.contains(text) && (only_schema.is_empty() || only_schema == schema) {
                return answer.clone();
            }
        }
        Ok(Vec::new())
    }
}

pub fn row(cols: &[(&str, Value)]) -> SourceRow {
    SourceRow::new(cols.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

/// A MySQL catalog with one readable schema and one that denies table listing.
pub fn mysql_shop() -> FakeSession {
    FakeSession {
        answers: vec![
            (
                "INFORMATION_SCHEMA.SCHEMATA",
                Ok(vec![
                    row(&[("schema_name", Value::from("shop"))]),
                    row(&[("schema_name", Value::from("audit"))]),
                ]),
            ),
            (
                "INFORMATION_SCHEMA.TABLES@shop",
                Ok(vec![
                    row(&[("table_name", Value::from("orders"))]),
                    row(&[("table_name", Value::from("customers"))]),
                ]),
            ),
            ("INFORMATION_SCHEMA.TABLES@audit", Err(QueryError("access denied".into()))),
            (
                "INFORMATION_SCHEMA.VIEWS@shop",
                Ok(vec![row(&[
                    ("view_name", Value::from("big_orders")),
                    ("view_definition", Value::from("select * from orders where total > 100")),
                ])]),
            ),
            (
                "INFORMATION_SCHEMA.ROUTINES@shop",
                Ok(vec![row(&[
                    ("proc_name", Value::from("close_month")),
                    ("proc_type", Value::from("PROCEDURE")),
                    ("proc_definition", Value::from("BEGIN UPDATE orders SET closed = 1; END")),
                ])]),
            ),
            (
                "INFORMATION_SCHEMA.COLUMNS",
                Ok(vec![
                    row(&[
                        ("COLUMN_NAME", Value::from("id")),
                        ("DATA_TYPE", Value::from("int")),
                        ("CHARACTER_MAXIMUM_LENGTH", Value::Null),
                        ("NUMERIC_PRECISION", Value::from(10)),
                        ("NUMERIC_SCALE", Value::from(0)),
                        ("IS_NULLABLE", Value::from("NO")),
                    ]),
                    row(&[
                        ("COLUMN_NAME", Value::from("note")),
                        ("DATA_TYPE", Value::from("varchar")),
                        ("CHARACTER_MAXIMUM_LENGTH", Value::from(200)),
                        ("NUMERIC_PRECISION", Value::Null),
                        ("NUMERIC_SCALE", Value::Null),
                        ("IS_NULLABLE", Value::from("YES")),
                    ]),
                ]),
            ),
            ("SHOW CREATE TABLE", Err(QueryError("SHOW privilege missing".into()))),
        ],
    }
}

/// Federation is never available; direct connections get a fresh `mysql_shop` session.
pub struct FakeConnector;

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        method: ConnectionMethod,
    ) -> Result<Arc<dyn SourceSession>, ConnectError> {
        match method {
            ConnectionMethod::Federated => Err(ConnectError::HostUnreachable(
                "no federation for this host".into(),
            )),
            ConnectionMethod::Direct if config.password.expose() == "wrong" => {
                Err(ConnectError::AuthFailed("access denied for user".into()))
            }
            ConnectionMethod::Direct => Ok(Arc::new(mysql_shop())),
        }
    }
}

pub fn mysql_config(password: &str) -> ConnectionConfig {
    ConnectionConfig {
        source_type: SourceDialect::MySql,
        host: "mysql.internal".into(),
        port: None,
        database: "shop".into(),
        username: "migrator".into(),
        password: Secret::new(password),
        method: None,
        additional_params: BTreeMap::new(),
    }
}
