use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::fingerprint;
use crate::types::{ConnectionId, ObjectType, SourceDialect};

/// Column metadata as reported by the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub source_type: String,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
}

/// One migratable object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub schema: String,
    pub name: String,
    pub object_type: ObjectType,
    /// DDL or body text in the source dialect; empty when the catalog has none.
    pub source_definition: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    /// Tables only, and only when row counting is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl InventoryItem {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A schema that could not be read at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSchema {
    pub schema: String,
    pub reason: String,
}

/// A non-fatal lookup failure inside a readable schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractIssue {
    pub schema: String,
    pub object: Option<String>,
    /// What was being looked up: `views`, `routines`, `columns` or `ddl`.
    pub scope: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub schemas: usize,
    pub tables: usize,
    pub views: usize,
    pub procedures: usize,
    pub functions: usize,
    pub total: usize,
}

/// Immutable result of one extraction against one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub id: String,
    pub connection_id: ConnectionId,
    pub source_type: SourceDialect,
    pub source_database: String,
    pub extracted_at: DateTime<Utc>,
    pub items: Vec<InventoryItem>,
    pub summary: InventorySummary,
    #[serde(default)]
    pub skipped_schemas: Vec<SkippedSchema>,
    #[serde(default)]
    pub issues: Vec<ExtractIssue>,
    /// SHA-256 over the canonical JSON of `items`.
    pub fingerprint: String,
}

/// Accumulates extraction output; `finish` sorts and seals it.
#[derive(Debug)]
pub struct InventoryBuilder {
    connection_id: ConnectionId,
    source_type: SourceDialect,
    source_database: String,
    items: Vec<InventoryItem>,
    schemas: Vec<String>,
    skipped_schemas: Vec<SkippedSchema>,
    issues: Vec<ExtractIssue>,
}

impl InventoryBuilder {
    pub fn new(
        connection_id: ConnectionId,
        source_type: SourceDialect,
        source_database: impl Into<String>,
    ) -> Self {
        InventoryBuilder {
            connection_id,
            source_type,
            source_database: source_database.into(),
            items: Vec::new(),
            schemas: Vec::new(),
            skipped_schemas: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn add_schema(&mut self, schema: &str, items: Vec<InventoryItem>) {
        self.schemas.push(schema.to_string());
        self.items.extend(items);
    }

    pub fn skip_schema(&mut self, schema: &str, reason: impl Into<String>) {
        self.skipped_schemas.push(SkippedSchema {
            schema: schema.to_string(),
            reason: reason.into(),
        });
    }

    pub fn issue(&mut self, issue: ExtractIssue) {
        self.issues.push(issue);
    }

    pub fn finish(mut self) -> Result<Inventory> {
        self.items.sort_by(|a, b| {
            a.schema
                .cmp(&b.schema)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.object_type.cmp(&b.object_type))
        });
        self.skipped_schemas.sort_by(|a, b| a.schema.cmp(&b.schema));
        self.schemas.sort();
        self.schemas.dedup();

        let mut summary = InventorySummary {
            schemas: self.schemas.len(),
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            match item.object_type {
                ObjectType::Table => summary.tables += 1,
                ObjectType::View => summary.views += 1,
                ObjectType::Procedure => summary.procedures += 1,
                ObjectType::Function => summary.functions += 1,
            }
        }

        let fingerprint = fingerprint(&self.items)?;
        Ok(Inventory {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: self.connection_id,
            source_type: self.source_type,
            source_database: self.source_database,
            extracted_at: Utc::now(),
            items: self.items,
            summary,
            skipped_schemas: self.skipped_schemas,
            issues: self.issues,
            fingerprint,
        })
    }
}
