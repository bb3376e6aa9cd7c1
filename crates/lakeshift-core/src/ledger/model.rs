use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactHandle;
use crate::error::Result;
use crate::hash::{chain_hash, fingerprint};
use crate::pipeline::MigrationObjectResult;
use crate::types::{ExecutionId, JobId, ObjectStatus, RunId, RunStatus, SourceDialect, TriggeredBy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunTotals {
    pub fn from_results(results: &[MigrationObjectResult]) -> Self {
        let mut totals = RunTotals::default();
        for r in results {
            totals.add(r.status);
        }
        totals
    }

    pub fn add(&mut self, status: ObjectStatus) {
        match status {
            ObjectStatus::Success => self.succeeded += 1,
            ObjectStatus::Error => self.failed += 1,
            ObjectStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of a run's bounded log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A finished bulk migration, frozen at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: RunId,
    pub job_id: Option<JobId>,
    pub inventory_ref: ArtifactHandle,
    pub source_dialect: SourceDialect,
    pub target_catalog: String,
    pub target_schema: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Sorted by inventory order.
    pub results: Vec<MigrationObjectResult>,
    pub totals: RunTotals,
    pub abort_reason: Option<String>,
    pub error_log: Option<ArtifactHandle>,
    #[serde(default)]
    pub log: Vec<RunLogEntry>,
}

/// How an Execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExecutionOutcome {
    /// Run started; the ledger row is written when it finalizes.
    Dispatched,
    Finished { status: RunStatus, totals: RunTotals },
    /// No run was created.
    Rejected { kind: String, message: String },
}

/// Append-only record linking a trigger to the run it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub job_id: Option<JobId>,
    pub run_id: Option<RunId>,
    pub triggered_by: TriggeredBy,
    pub outcome: ExecutionOutcome,
    pub timestamp: DateTime<Utc>,
    /// Set when the row is appended to the ledger.
    pub integrity_hash: Option<String>,
}

impl Execution {
    pub fn dispatched(job_id: Option<JobId>, run_id: RunId, triggered_by: TriggeredBy) -> Self {
        Execution {
            execution_id: ExecutionId::generate(),
            job_id,
            run_id: Some(run_id),
            triggered_by,
            outcome: ExecutionOutcome::Dispatched,
            timestamp: Utc::now(),
            integrity_hash: None,
        }
    }

    pub fn rejected(
        job_id: Option<JobId>,
        triggered_by: TriggeredBy,
        kind: &str,
        message: impl Into<String>,
    ) -> Self {
        Execution {
            execution_id: ExecutionId::generate(),
            job_id,
            run_id: None,
            triggered_by,
            outcome: ExecutionOutcome::Rejected {
                kind: kind.to_string(),
                message: message.into(),
            },
            timestamp: Utc::now(),
            integrity_hash: None,
        }
    }

    /// Timestamp as stored and hashed.
    pub fn timestamp_text(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Chain hash of this row given the previous row's hash.
    pub fn compute_hash(&self, prev_hash: Option<&str>) -> Result<String> {
        let outcome = fingerprint(&self.outcome)?;
        let timestamp = self.timestamp_text();
        Ok(chain_hash(
            &[
                self.execution_id.as_str(),
                self.job_id.as_ref().map(JobId::as_str).unwrap_or(""),
                self.run_id.as_ref().map(RunId::as_str).unwrap_or(""),
                &self.triggered_by.to_string(),
                &outcome,
                &timestamp,
            ],
            prev_hash,
        ))
    }
}

/// Live (or final) progress of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current_object: Option<String>,
    pub percent: f64,
    /// Estimated seconds remaining, from the average time per finished object.
    pub eta_secs: Option<u64>,
}

impl RunProgress {
    pub fn from_run(run: &MigrationRun) -> Self {
        let total = run.results.len();
        RunProgress {
            run_id: run.run_id.clone(),
            status: run.status,
            total,
            completed: run.totals.total(),
            succeeded: run.totals.succeeded,
            failed: run.totals.failed,
            skipped: run.totals.skipped,
            current_object: None,
            percent: 100.0,
            eta_secs: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_covers_outcome() {
        let mut exec = Execution::dispatched(None, RunId::from("r1"), TriggeredBy::Manual);
        let before = exec.compute_hash(None).unwrap();
        exec.outcome = ExecutionOutcome::Finished {
            status: RunStatus::Completed,
            totals: RunTotals {
                succeeded: 1,
                ..Default::default()
            },
        };
        assert_ne!(before, exec.compute_hash(None).unwrap());
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = ExecutionOutcome::Rejected {
            kind: "already_running".into(),
            message: "busy".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["kind"], "already_running");
    }
}
