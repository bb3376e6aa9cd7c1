use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ValidationError};

/// What a successful target statement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "rows")]
pub enum TargetChange {
    RowsAffected(u64),
    SchemaChange,
}

/// SQL engine of the target lakehouse.
#[async_trait]
pub trait TargetExecutor: Send + Sync {
    /// Check a statement without side effects (parse/plan only).
    async fn validate(&self, sql: &str) -> Result<(), ValidationError>;

    /// Run a statement for real.
    async fn execute(&self, sql: &str) -> Result<TargetChange, ExecutionError>;
}
