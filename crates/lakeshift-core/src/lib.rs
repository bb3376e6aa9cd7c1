pub mod artifact;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod extract;
pub mod hash;
pub mod inventory;
pub mod ledger;
pub mod pipeline;
pub mod report;
pub mod schedule;
pub mod target;
pub mod translate;
pub mod types;

#[cfg(feature = "postgres")]
pub use ledger::PostgresLedgerStore;

// Re-export primary types for convenience
pub use artifact::{ArtifactHandle, ArtifactStore, FsArtifactStore, InventoryStore, MemoryArtifactStore};
pub use config::EngineConfig;
pub use connection::{
    Connection, ConnectionConfig, ConnectionRegistry, Secret, SourceConnector, SourceHandle,
    SourceRow, SourceSession,
};
pub use coordinator::{BatchCoordinator, MigrationRequest, RunHandle, Trigger};
pub use engine::{Collaborators, MigrationEngine};
pub use error::{
    CancelError, ConnectError, EngineError, ExecutionError, ExtractError, QueryError, Result,
    ScheduleError, TranslateError, ValidationError,
};
pub use extract::{CatalogExtractor, Extractor, ExtractorRegistry};
pub use inventory::{ColumnInfo, Inventory, InventoryItem, InventorySummary};
pub use ledger::{
    Execution, ExecutionFilter, ExecutionOutcome, IntegrityReport, Ledger, LedgerStore,
    MigrationRun, RunProgress, RunTotals, SqliteLedgerStore,
};
pub use pipeline::{MigrationObjectResult, ObjectPipeline, RunSignals};
pub use schedule::{MigrationTemplate, NewSchedule, Schedule, SchedulePatch, ScheduleSpec, Scheduler};
pub use target::{TargetChange, TargetExecutor};
pub use translate::{TranslationRequest, Translator};
pub use types::{
    ConnectionId, ConnectionMethod, ExecutionId, JobId, ObjectStatus, ObjectType, RunId,
    RunStatus, SkipReason, SourceDialect, TriggeredBy,
};
