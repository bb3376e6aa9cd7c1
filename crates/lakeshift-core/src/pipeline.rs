//! Per-object migration state machine.
//!
//! `Pending -> Translating -> Validating -> Done` on a dry run, or
//! `... -> Validating -> Executing -> Done` on a live run. Any stage may end in
//! `Failed`; stop signals are honoured only between stages.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecutionError, ValidationError};
use crate::inventory::InventoryItem;
use crate::target::TargetExecutor;
use crate::translate::{clean_translation, TranslationRequest, Translator};
use crate::types::{ObjectStatus, ObjectType, SkipReason, SourceDialect};

/// Outcome of one inventory item within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationObjectResult {
    pub object_name: String,
    pub object_type: ObjectType,
    pub source_sql: String,
    pub target_sql: Option<String>,
    pub status: ObjectStatus,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub execution_time_ms: Option<u64>,
}

impl MigrationObjectResult {
    /// An item that never entered the pipeline.
    pub fn skipped(item: &InventoryItem, reason: SkipReason) -> Self {
        MigrationObjectResult {
            object_name: item.qualified_name(),
            object_type: item.object_type,
            source_sql: item.source_definition.clone(),
            target_sql: None,
            status: ObjectStatus::Skipped,
            error_message: None,
            error_kind: None,
            skip_reason: Some(reason),
            execution_time_ms: None,
        }
    }

    /// An item whose pipeline task died without producing a result.
    pub fn internal_failure(item: &InventoryItem, message: impl Into<String>) -> Self {
        MigrationObjectResult {
            status: ObjectStatus::Error,
            error_message: Some(message.into()),
            error_kind: Some("internal".to_string()),
            skip_reason: None,
            ..Self::skipped(item, SkipReason::Cancelled)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Pending,
    Translating,
    Validating,
    Executing,
    Done,
    Failed,
    Skipped,
}

impl ObjectState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ObjectState::Done | ObjectState::Failed | ObjectState::Skipped)
    }
}

/// Cooperative stop signals shared by every pipeline of one run.
///
/// `cancel` is the operator's request; `stop` fires on cancel or on abort.
#[derive(Debug, Clone)]
pub struct RunSignals {
    cancel: CancellationToken,
    stop: CancellationToken,
    abort_reason: Arc<OnceLock<String>>,
}

impl Default for RunSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignals {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        RunSignals {
            cancel,
            stop,
            abort_reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Abort the run. Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.abort_reason.set(reason.into());
        self.stop.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the run is cancelled or aborted.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.get().map(String::as_str)
    }

    /// Skip reason for items that never got to run.
    pub fn skip_reason(&self) -> SkipReason {
        if self.abort_reason.get().is_some() {
            SkipReason::RunAborted
        } else {
            SkipReason::Cancelled
        }
    }
}

/// Immutable settings shared by all pipelines of one run.
pub struct PipelineContext {
    pub translator: Arc<dyn Translator>,
    pub executor: Arc<dyn TargetExecutor>,
    pub source_dialect: SourceDialect,
    pub target_catalog: String,
    pub target_schema: String,
    pub dry_run: bool,
    pub excluded: HashSet<ObjectType>,
    pub call_timeout: Duration,
}

struct Failure {
    kind: String,
    message: String,
}

/// Drives one inventory item to a terminal state.
pub struct ObjectPipeline<'a> {
    ctx: &'a PipelineContext,
    item: &'a InventoryItem,
    signals: &'a RunSignals,
    state: ObjectState,
    started: Option<Instant>,
    target_sql: Option<String>,
    failure: Option<Failure>,
    skip_reason: Option<SkipReason>,
}

impl<'a> ObjectPipeline<'a> {
    pub fn new(ctx: &'a PipelineContext, item: &'a InventoryItem, signals: &'a RunSignals) -> Self {
        ObjectPipeline {
            ctx,
            item,
            signals,
            state: ObjectState::Pending,
            started: None,
            target_sql: None,
            failure: None,
            skip_reason: None,
        }
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub async fn run(mut self) -> MigrationObjectResult {
        while !self.state.is_terminal() {
            let next = match self.state {
                ObjectState::Pending => self.admit(),
                ObjectState::Translating => self.translate().await,
                ObjectState::Validating => self.validate().await,
                ObjectState::Executing => self.execute().await,
                ObjectState::Done | ObjectState::Failed | ObjectState::Skipped => break,
            };
            debug!(object = %self.item.qualified_name(), from = ?self.state, to = ?next, "object state");
            self.state = next;
        }
        self.into_result()
    }

    fn skip(&mut self, reason: SkipReason) -> ObjectState {
        self.skip_reason = Some(reason);
        ObjectState::Skipped
    }

    fn fail(&mut self, kind: &str, message: impl Into<String>) -> ObjectState {
        let message = message.into();
        warn!(object = %self.item.qualified_name(), kind, error = %message, "object failed");
        self.failure = Some(Failure {
            kind: kind.to_string(),
            message,
        });
        ObjectState::Failed
    }

    fn admit(&mut self) -> ObjectState {
        if self.ctx.excluded.contains(&self.item.object_type) {
            return self.skip(SkipReason::Excluded);
        }
        if self.item.source_definition.trim().is_empty() {
            return self.skip(SkipReason::NoSourceSql);
        }
        if self.signals.is_stopped() {
            return self.skip(self.signals.skip_reason());
        }
        self.started = Some(Instant::now());
        ObjectState::Translating
    }

    async fn bounded<T, F>(&self, stage: &str, call: F) -> Result<T, String>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.ctx.call_timeout, call)
            .await
            .map_err(|_| {
                format!(
                    "{stage} timed out after {} ms",
                    self.ctx.call_timeout.as_millis()
                )
            })
    }

    async fn translate(&mut self) -> ObjectState {
        let request = TranslationRequest {
            object_type: self.item.object_type,
            source_sql: &self.item.source_definition,
            source_dialect: self.ctx.source_dialect,
            target_catalog: &self.ctx.target_catalog,
            target_schema: &self.ctx.target_schema,
        };
        let outcome = self
            .bounded("translate", self.ctx.translator.translate(request))
            .await;

        let sql = match outcome {
            Err(timeout) => return self.fail("timeout", timeout),
            Ok(Err(e)) => return self.fail(e.kind(), e.to_string()),
            Ok(Ok(raw)) => match clean_translation(&raw) {
                Ok(sql) => sql,
                Err(e) => return self.fail(e.kind(), e.to_string()),
            },
        };
        self.target_sql = Some(sql);

        if self.signals.is_stopped() {
            return self.skip(self.signals.skip_reason());
        }
        ObjectState::Validating
    }

    async fn validate(&mut self) -> ObjectState {
        let sql = self.target_sql.clone().unwrap_or_default();
        let outcome = self
            .bounded("validate", self.ctx.executor.validate(&sql))
            .await;

        match outcome {
            Err(timeout) => return self.fail("timeout", timeout),
            Ok(Err(e)) => {
                if let ValidationError::TargetUnavailable(reason) = &e {
                    self.signals.abort(format!("target unavailable: {reason}"));
                }
                return self.fail(e.kind(), e.to_string());
            }
            Ok(Ok(())) => {}
        }

        if self.ctx.dry_run {
            return ObjectState::Done;
        }
        if self.signals.is_stopped() {
            return self.skip(self.signals.skip_reason());
        }
        ObjectState::Executing
    }

    async fn execute(&mut self) -> ObjectState {
        let sql = self.target_sql.clone().unwrap_or_default();
        let outcome = self
            .bounded("execute", self.ctx.executor.execute(&sql))
            .await;

        match outcome {
            Err(timeout) => self.fail("timeout", timeout),
            Ok(Err(e)) => {
                if let ExecutionError::TargetUnavailable(reason) = &e {
                    self.signals.abort(format!("target unavailable: {reason}"));
                }
                self.fail(e.kind(), e.to_string())
            }
            Ok(Ok(change)) => {
                debug!(object = %self.item.qualified_name(), ?change, "statement applied");
                ObjectState::Done
            }
        }
    }

    fn into_result(self) -> MigrationObjectResult {
        let status = match self.state {
            ObjectState::Done => ObjectStatus::Success,
            ObjectState::Skipped => ObjectStatus::Skipped,
            _ => ObjectStatus::Error,
        };
        let (error_kind, error_message) = match self.failure {
            Some(f) => (Some(f.kind), Some(f.message)),
            None => (None, None),
        };
        MigrationObjectResult {
            object_name: self.item.qualified_name(),
            object_type: self.item.object_type,
            source_sql: self.item.source_definition.clone(),
            target_sql: self.target_sql,
            status,
            error_message,
            error_kind,
            skip_reason: self.skip_reason,
            execution_time_ms: self
                .started
                .map(|t| saturating_millis(t.elapsed())),
        }
    }
}

/// Whole milliseconds in `d`, clamped to `u64::MAX`.
pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
