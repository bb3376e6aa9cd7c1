//! Error reports written next to a run when any object failed.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::{ArtifactHandle, ArtifactStore};
use crate::error::Result;
use crate::pipeline::MigrationObjectResult;
use crate::types::{ObjectStatus, ObjectType, RunId, SourceDialect};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReportEntry {
    pub object_name: String,
    pub object_type: ObjectType,
    pub source_sql: String,
    pub target_sql: Option<String>,
    pub error: String,
    pub error_kind: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Failed objects of one run, ready to be stored.
#[derive(Debug, Clone)]
pub struct ErrorReport<'a> {
    pub run_id: &'a RunId,
    pub source_dialect: SourceDialect,
    pub target_catalog: &'a str,
    pub target_schema: &'a str,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ErrorReportEntry>,
}

impl<'a> ErrorReport<'a> {
    /// `None` when no result failed.
    pub fn from_results(
        run_id: &'a RunId,
        source_dialect: SourceDialect,
        target_catalog: &'a str,
        target_schema: &'a str,
        results: &[MigrationObjectResult],
    ) -> Option<Self> {
        let generated_at = Utc::now();
        let entries: Vec<ErrorReportEntry> = results
            .iter()
            .filter(|r| r.status == ObjectStatus::Error)
            .map(|r| ErrorReportEntry {
                object_name: r.object_name.clone(),
                object_type: r.object_type,
                source_sql: r.source_sql.clone(),
                target_sql: r.target_sql.clone(),
                error: r.error_message.clone().unwrap_or_default(),
                error_kind: r.error_kind.clone(),
                timestamp: generated_at,
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(ErrorReport {
            run_id,
            source_dialect,
            target_catalog,
            target_schema,
            generated_at,
            entries,
        })
    }

    /// Readable rendering with source and target SQL for every failure.
    pub fn render_sql(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "-- Migration Error Log - {}",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(out, "-- Run: {}", self.run_id);
        let _ = writeln!(out, "-- Source Type: {}", self.source_dialect.display_name());
        let _ = writeln!(out, "-- Target: {}.{}", self.target_catalog, self.target_schema);
        let _ = writeln!(out, "-- Failed objects: {}", self.entries.len());

        for entry in &self.entries {
            out.push('\n');
            let _ = writeln!(out, "-- {}", "=".repeat(76));
            let _ = writeln!(out, "-- Object: {} ({})", entry.object_name, entry.object_type);
            for line in entry.error.lines() {
                let _ = writeln!(out, "-- Error: {line}");
            }
            if let Some(kind) = &entry.error_kind {
                let _ = writeln!(out, "-- Kind: {kind}");
            }
            let _ = writeln!(out, "-- {}", "=".repeat(76));
            out.push('\n');
            out.push_str("-- SOURCE SQL:\n");
            out.push_str(entry.source_sql.trim_end());
            out.push_str("\n\n");
            out.push_str("-- TARGET SQL:\n");
            match &entry.target_sql {
                Some(sql) => out.push_str(sql.trim_end()),
                None => out.push_str("-- (no translation produced)"),
            }
            out.push('\n');
        }
        out
    }

    /// Store the JSON list and the `.sql` rendering; returns the JSON handle.
    pub async fn write(&self, store: &dyn ArtifactStore) -> Result<ArtifactHandle> {
        let stamp = self.generated_at.format("%Y%m%d_%H%M%S");
        let base = format!("runs/{}/migration_errors_{stamp}", self.run_id);

        let json = serde_json::to_vec_pretty(&self.entries)?;
        let handle = store.put(&format!("{base}.json"), json).await?;
        store
            .put(&format!("{base}.sql"), self.render_sql().into_bytes())
            .await?;

        info!(
            run_id = %self.run_id,
            failed = self.entries.len(),
            artifact = %handle,
            "error report written"
        );
        Ok(handle)
    }
}
