use thiserror::Error;

use crate::types::{JobId, RunId};

/// Failure to establish a session with a source warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("unsupported source dialect: {0}")]
    UnsupportedDialect(String),

    #[error("connection attempt timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
}

impl ConnectError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::AuthFailed(_) => "auth_failed",
            ConnectError::HostUnreachable(_) => "host_unreachable",
            ConnectError::UnsupportedDialect(_) => "unsupported_dialect",
            ConnectError::Timeout { .. } => "timeout",
        }
    }
}

/// A catalog query against a source session failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source query failed: {0}")]
pub struct QueryError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("schema {schema} could not be extracted: {reason}")]
    PartialFailure { schema: String, reason: String },

    #[error("extraction failed: {0}")]
    Fatal(String),
}

impl ExtractError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::PartialFailure { .. } => "partial_failure",
            ExtractError::Fatal(_) => "extract_fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("translation model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("translation produced invalid output: {0}")]
    InvalidOutput(String),
}

impl TranslateError {
    pub fn kind(&self) -> &'static str {
        match self {
            TranslateError::ModelUnavailable(_) => "model_unavailable",
            TranslateError::InvalidOutput(_) => "invalid_output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("target rejected statement: {0}")]
    Rejected(String),

    /// The target cannot be reached at all; aborts the whole run.
    #[error("target unavailable during validation: {0}")]
    TargetUnavailable(String),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::Rejected(_) => "validation_failed",
            ValidationError::TargetUnavailable(_) => "target_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("statement failed on target: {0}")]
    Failed(String),

    /// The target cannot be reached at all; aborts the whole run.
    #[error("target unavailable during execution: {0}")]
    TargetUnavailable(String),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Failed(_) => "execution_failed",
            ExecutionError::TargetUnavailable(_) => "target_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} already has run {run_id} in flight")]
    AlreadyRunning { job_id: JobId, run_id: RunId },

    #[error("invalid schedule spec: {0}")]
    InvalidSpec(String),

    #[error("inventory unavailable: {0}")]
    InventoryUnavailable(String),
}

impl ScheduleError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleError::NotFound(_) => "not_found",
            ScheduleError::AlreadyRunning { .. } => "already_running",
            ScheduleError::InvalidSpec(_) => "invalid_spec",
            ScheduleError::InventoryUnavailable(_) => "inventory_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run already finished: {0}")]
    AlreadyFinished(RunId),
}

impl CancelError {
    pub fn kind(&self) -> &'static str {
        match self {
            CancelError::NotFound(_) => "not_found",
            CancelError::AlreadyFinished(_) => "already_finished",
        }
    }
}

/// Crate-level error for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Cancel(#[from] CancelError),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Connect(e) => e.kind(),
            EngineError::Extract(e) => e.kind(),
            EngineError::Schedule(e) => e.kind(),
            EngineError::Cancel(e) => e.kind(),
            EngineError::ConnectionNotFound(_) => "connection_not_found",
            EngineError::ArtifactNotFound(_) => "artifact_not_found",
            EngineError::Storage(_) => "storage",
            EngineError::Serialization(_) => "serialization",
            EngineError::Config(_) => "config",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
