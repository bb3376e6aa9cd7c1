use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::artifact::{ArtifactHandle, ArtifactStore, FsArtifactStore, InventoryStore};
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionConfig, ConnectionRegistry, SourceConnector};
use crate::coordinator::{BatchCoordinator, MigrationRequest, RunHandle, Trigger};
use crate::error::{EngineError, Result};
use crate::extract::ExtractorRegistry;
use crate::inventory::Inventory;
use crate::ledger::{
    Execution, IntegrityReport, Ledger, LedgerStore, MigrationRun, RunProgress, SqliteLedgerStore,
};
use crate::schedule::{NewSchedule, Schedule, SchedulePatch, Scheduler};
use crate::target::TargetExecutor;
use crate::translate::Translator;
use crate::types::{ConnectionId, JobId, RunId};

/// External systems the engine drives.
pub struct Collaborators {
    pub connector: Arc<dyn SourceConnector>,
    pub translator: Arc<dyn Translator>,
    pub executor: Arc<dyn TargetExecutor>,
    pub extractors: ExtractorRegistry,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub ledger: Box<dyn LedgerStore>,
}

/// Entry point: connections, inventories, runs, schedules and history.
pub struct MigrationEngine {
    config: EngineConfig,
    connections: ConnectionRegistry,
    extractors: ExtractorRegistry,
    inventories: Arc<InventoryStore>,
    ledger: Arc<Ledger>,
    coordinator: Arc<BatchCoordinator>,
    scheduler: Arc<Scheduler>,
}

impl MigrationEngine {
    /// Build an engine over explicit collaborators.
    pub async fn init(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(Ledger::open(collaborators.ledger, config.run_log_capacity).await?);
        let inventories = Arc::new(InventoryStore::new(collaborators.artifacts.clone()));
        let coordinator = Arc::new(
            BatchCoordinator::new(
                collaborators.translator,
                collaborators.executor,
                ledger.clone(),
                &config,
            )
            .with_artifacts(collaborators.artifacts),
        );
        let scheduler = Arc::new(Scheduler::new(
            coordinator.clone(),
            inventories.clone(),
            config.scheduler_tick(),
        ));

        info!(
            max_concurrency = config.max_concurrency,
            call_timeout_secs = config.call_timeout_secs,
            "migration engine ready"
        );
        Ok(MigrationEngine {
            connections: ConnectionRegistry::new(collaborators.connector, config.connect_timeout()),
            extractors: collaborators.extractors,
            inventories,
            ledger,
            coordinator,
            scheduler,
            config,
        })
    }

    /// Build an engine with the SQLite ledger at `config.ledger_path`, artifacts
    /// under `config.artifact_root`, and the catalog extractors (counting table
    /// rows when `config.count_table_rows` is set).
    pub async fn open(
        config: EngineConfig,
        connector: Arc<dyn SourceConnector>,
        translator: Arc<dyn Translator>,
        executor: Arc<dyn TargetExecutor>,
    ) -> Result<Self> {
        let ledger = SqliteLedgerStore::new(&config.ledger_path).await?;
        let artifacts = Arc::new(FsArtifactStore::new(config.artifact_root.clone()));
        let extractors = ExtractorRegistry::with_catalog(config.count_table_rows);
        Self::init(
            config,
            Collaborators {
                connector,
                translator,
                executor,
                extractors,
                artifacts,
                ledger: Box::new(ledger),
            },
        )
        .await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Connections

    pub async fn register_connection(&self, config: &ConnectionConfig) -> Result<Connection> {
        Ok(self.connections.test_connection(config).await?)
    }

    pub async fn list_connections(&self) -> Vec<Connection> {
        self.connections.list().await
    }

    /// Forget a connection. Unknown ids are ignored.
    pub async fn disconnect(&self, id: &ConnectionId) {
        self.connections.forget(id).await;
    }

    // Inventories

    /// Extract, persist and return an inventory with its artifact handle.
    pub async fn extract_inventory(
        &self,
        connection_id: &ConnectionId,
        schema_filter: Option<&[String]>,
    ) -> Result<(ArtifactHandle, Inventory)> {
        let source = self
            .connections
            .handle(connection_id)
            .await
            .ok_or_else(|| EngineError::ConnectionNotFound(connection_id.to_string()))?;
        let inventory = self.extractors.extract(&source, schema_filter).await?;
        let handle = self.inventories.save(&inventory).await?;
        info!(
            connection_id = %connection_id,
            items = inventory.items.len(),
            skipped_schemas = inventory.skipped_schemas.len(),
            artifact = %handle,
            "inventory saved"
        );
        Ok((handle, inventory))
    }

    pub async fn fetch_ddl(
        &self,
        connection_id: &ConnectionId,
        schema: &str,
        object: &str,
    ) -> Result<String> {
        let source = self
            .connections
            .handle(connection_id)
            .await
            .ok_or_else(|| EngineError::ConnectionNotFound(connection_id.to_string()))?;
        Ok(self.extractors.fetch_ddl(&source, schema, object).await?)
    }

    pub async fn load_inventory(&self, handle: &ArtifactHandle) -> Result<Inventory> {
        self.inventories.load(handle).await
    }

    pub async fn list_inventories(&self) -> Result<Vec<ArtifactHandle>> {
        self.inventories.list().await
    }

    // Runs

    /// Start a manual bulk migration; returns as soon as the run is dispatched.
    pub async fn run_bulk_migration(
        &self,
        inventory_ref: &ArtifactHandle,
        target_catalog: &str,
        target_schema: &str,
        dry_run: bool,
    ) -> Result<RunHandle> {
        let inventory = Arc::new(self.inventories.load(inventory_ref).await?);
        self.coordinator
            .start(
                MigrationRequest {
                    inventory,
                    inventory_ref: inventory_ref.clone(),
                    target_catalog: target_catalog.to_string(),
                    target_schema: target_schema.to_string(),
                    dry_run,
                },
                Trigger::manual(),
            )
            .await
    }

    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        self.ledger.cancel(run_id).await
    }

    pub async fn get_run_progress(&self, run_id: &RunId) -> Result<Option<RunProgress>> {
        self.ledger.progress(run_id).await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
        self.ledger.get(run_id).await
    }

    pub async fn await_run(&self, run_id: &RunId) -> Result<Option<MigrationRun>> {
        self.ledger.await_finished(run_id).await
    }

    pub async fn list_execution_history(
        &self,
        job_id: Option<&JobId>,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        self.ledger.list_executions(job_id, limit).await
    }

    pub async fn verify_ledger(&self) -> Result<IntegrityReport> {
        self.ledger.verify_integrity().await
    }

    /// Retry ledger writes for finished runs whose recording failed.
    pub async fn retry_unrecorded_runs(&self) -> Result<usize> {
        self.ledger.retry_unrecorded().await
    }

    // Schedules

    pub async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        self.scheduler.create(new).await
    }

    pub async fn list_schedules(&self) -> Vec<Schedule> {
        self.scheduler.list().await
    }

    pub async fn get_schedule(&self, job_id: &JobId) -> Result<Schedule> {
        self.scheduler.get(job_id).await
    }

    pub async fn update_schedule(&self, job_id: &JobId, patch: SchedulePatch) -> Result<Schedule> {
        self.scheduler.update(job_id, patch).await
    }

    pub async fn delete_schedule(&self, job_id: &JobId) -> Result<()> {
        self.scheduler.delete(job_id).await
    }

    pub async fn run_schedule_now(&self, job_id: &JobId) -> Result<Execution> {
        self.scheduler.run_now(job_id).await
    }

    /// Drive the scheduler in the background until `shutdown` is cancelled.
    pub fn start_scheduler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.scheduler.clone().spawn(shutdown)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
