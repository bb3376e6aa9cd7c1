use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::queries::{CatalogQueries, CatalogQuery};
use super::Extractor;
use crate::connection::{value_to_string, SourceHandle, SourceRow, SourceSession};
use crate::error::{ExtractError, QueryError};
use crate::inventory::{ColumnInfo, ExtractIssue, Inventory, InventoryBuilder, InventoryItem};
use crate::types::{ObjectType, SourceDialect};

/// Query-driven extractor reading the source's own system catalog.
pub struct CatalogExtractor {
    dialect: SourceDialect,
    queries: &'static CatalogQueries,
    count_rows: bool,
}

/// Items and non-fatal issues from one readable schema.
struct SchemaScan {
    items: Vec<InventoryItem>,
    issues: Vec<ExtractIssue>,
}

impl CatalogExtractor {
    pub fn for_dialect(dialect: SourceDialect) -> Self {
        CatalogExtractor {
            dialect,
            queries: CatalogQueries::for_dialect(dialect),
            count_rows: false,
        }
    }

    pub fn with_queries(dialect: SourceDialect, queries: &'static CatalogQueries) -> Self {
        CatalogExtractor {
            dialect,
            queries,
            count_rows: false,
        }
    }

    /// Also run `COUNT(*)` against every extracted table.
    pub fn with_row_counts(mut self, enabled: bool) -> Self {
        self.count_rows = enabled;
        self
    }

    async fn run(
        &self,
        session: &dyn SourceSession,
        query: &CatalogQuery,
        database: &str,
        schema: Option<&str>,
        table: Option<&str>,
    ) -> Result<Vec<SourceRow>, QueryError> {
        let (sql, binds) = self.queries.prepare(query, database, schema, table);
        debug!(dialect = %self.dialect, sql = %sql, "catalog query");
        session.query(&sql, &binds).await
    }

    async fn list_schemas(&self, source: &SourceHandle) -> Result<Vec<String>, ExtractError> {
        let rows = self
            .run(
                source.session.as_ref(),
                &self.queries.schemas,
                &source.connection.database,
                None,
                None,
            )
            .await
            .map_err(|e| ExtractError::Fatal(format!("cannot list schemas: {}", e.0)))?;

        let mut schemas: Vec<String> = rows
            .iter()
            .filter_map(|row| {
                row.get_str(&["schema_name", "name"])
                    .or_else(|| row.at(0).and_then(value_to_string))
            })
            .filter(|s| !self.queries.is_system_schema(s))
            .collect();
        schemas.sort();
        schemas.dedup();
        Ok(schemas)
    }

    async fn scan_schema(
        &self,
        source: &SourceHandle,
        schema: &str,
    ) -> Result<SchemaScan, ExtractError> {
        let session = source.session.as_ref();
        let database = source.connection.database.as_str();

        let table_rows = self
            .run(session, &self.queries.tables, database, Some(schema), None)
            .await
            .map_err(|e| ExtractError::PartialFailure {
                schema: schema.to_string(),
                reason: e.0,
            })?;

        let mut scan = SchemaScan {
            items: Vec::new(),
            issues: Vec::new(),
        };

        for row in &table_rows {
            let Some(name) = row.get_str(&["table_name", "name"]) else {
                continue;
            };
            let item = self.table_item(session, database, schema, &name, &mut scan.issues).await;
            scan.items.push(item);
        }

        match self
            .run(session, &self.queries.views, database, Some(schema), None)
            .await
        {
            Ok(rows) => {
                for row in &rows {
                    let Some(name) = row.get_str(&["view_name", "name"]) else {
                        continue;
                    };
                    let body = row
                        .get_str(&["view_definition", "text"])
                        .unwrap_or_default();
                    scan.items.push(InventoryItem {
                        source_definition: view_statement(schema, &name, &body),
                        schema: schema.to_string(),
                        name,
                        object_type: ObjectType::View,
                        columns: Vec::new(),
                        row_count: None,
                    });
                }
            }
            Err(e) => {
                warn!(schema, error = %e, "view listing failed");
                scan.issues.push(issue(schema, None, "views", e));
            }
        }

        match self
            .run(session, &self.queries.routines, database, Some(schema), None)
            .await
        {
            Ok(rows) => {
                for row in &rows {
                    let Some(name) = row.get_str(&["proc_name", "name"]) else {
                        continue;
                    };
                    let kind = row.get_str(&["proc_type"]).unwrap_or_default();
                    scan.items.push(InventoryItem {
                        schema: schema.to_string(),
                        name,
                        object_type: routine_type(&kind),
                        source_definition: row
                            .get_str(&["proc_definition"])
                            .unwrap_or_default(),
                        columns: Vec::new(),
                        row_count: None,
                    });
                }
            }
            Err(e) => {
                warn!(schema, error = %e, "routine listing failed");
                scan.issues.push(issue(schema, None, "routines", e));
            }
        }

        Ok(scan)
    }

    async fn table_item(
        &self,
        session: &dyn SourceSession,
        database: &str,
        schema: &str,
        table: &str,
        issues: &mut Vec<ExtractIssue>,
    ) -> InventoryItem {
        let columns = match self.columns(session, database, schema, table).await {
            Ok(columns) => columns,
            Err(e) => {
                issues.push(issue(schema, Some(table), "columns", e));
                Vec::new()
            }
        };

        let ddl = match self.table_ddl(session, database, schema, table).await {
            Ok(ddl) => ddl,
            Err(e) => {
                issues.push(issue(schema, Some(table), "ddl", e));
                None
            }
        };

        let source_definition = match ddl {
            Some(ddl) => ddl,
            None if !columns.is_empty() => {
                synthesize_create_table(&format!("{schema}.{table}"), &columns)
            }
            None => String::new(),
        };

        let row_count = if self.count_rows {
            match self.row_count(session, database, schema, table).await {
                Ok(count) => count,
                Err(e) => {
                    issues.push(issue(schema, Some(table), "row_count", e));
                    None
                }
            }
        } else {
            None
        };

        InventoryItem {
            schema: schema.to_string(),
            name: table.to_string(),
            object_type: ObjectType::Table,
            source_definition,
            columns,
            row_count,
        }
    }

    async fn row_count(
        &self,
        session: &dyn SourceSession,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<u64>, QueryError> {
        let rows = self
            .run(session, &self.queries.table_count, database, Some(schema), Some(table))
            .await?;
        Ok(rows.first().and_then(|row| {
            row.get(&["row_count", "count"])
                .or_else(|| row.at(0))
                .and_then(count_value)
        }))
    }

    async fn columns(
        &self,
        session: &dyn SourceSession,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, QueryError> {
        let layout = self.queries.column_layout;
        let rows = self
            .run(session, &self.queries.columns, database, Some(schema), Some(table))
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.at(layout.name).and_then(value_to_string)?;
                Some(ColumnInfo {
                    name,
                    source_type: row
                        .at(layout.data_type)
                        .and_then(value_to_string)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                    length: layout.length.and_then(|i| cell_u32(row, i)),
                    precision: layout.precision.and_then(|i| cell_u32(row, i)),
                    scale: layout.scale.and_then(|i| cell_u32(row, i)),
                    nullable: layout
                        .nullable
                        .and_then(|i| row.at(i))
                        .map(is_truthy)
                        .unwrap_or(true),
                })
            })
            .collect())
    }

    async fn table_ddl(
        &self,
        session: &dyn SourceSession,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Option<String>, QueryError> {
        let Some(query) = self.queries.table_ddl else {
            return Ok(None);
        };
        let rows = self
            .run(session, &query, database, Some(schema), Some(table))
            .await?;

        let text = rows
            .iter()
            .filter_map(|row| {
                row.get(&["create table", "ddl"])
                    .or_else(|| row.last())
                    .and_then(value_to_string)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    async fn view_definition(
        &self,
        source: &SourceHandle,
        schema: &str,
        view: &str,
    ) -> Result<Option<String>, QueryError> {
        let rows = self
            .run(
                source.session.as_ref(),
                &self.queries.views,
                &source.connection.database,
                Some(schema),
                None,
            )
            .await?;
        Ok(rows
            .iter()
            .find(|row| row.get_str(&["view_name", "name"]).as_deref() == Some(view))
            .and_then(|row| row.get_str(&["view_definition", "text"]))
            .map(|body| view_statement(schema, view, &body)))
    }
}

#[async_trait]
impl Extractor for CatalogExtractor {
    async fn extract(
        &self,
        source: &SourceHandle,
        schema_filter: Option<&[String]>,
    ) -> Result<Inventory, ExtractError> {
        let connection = &source.connection;
        let mut builder = InventoryBuilder::new(
            connection.id.clone(),
            connection.source_type,
            connection.database.clone(),
        );

        let available = self.list_schemas(source).await?;
        let targets: Vec<String> = match schema_filter {
            None => available,
            Some(filter) => {
                let mut targets = Vec::new();
                for wanted in filter {
                    match available.iter().find(|s| s.eq_ignore_ascii_case(wanted)) {
                        Some(found) => targets.push(found.clone()),
                        None => builder.skip_schema(wanted, "schema not found in source catalog"),
                    }
                }
                targets.sort();
                targets.dedup();
                targets
            }
        };

        for schema in &targets {
            match self.scan_schema(source, schema).await {
                Ok(scan) => {
                    debug!(schema = %schema, objects = scan.items.len(), "schema scanned");
                    builder.add_schema(schema, scan.items);
                    for found in scan.issues {
                        builder.issue(found);
                    }
                }
                Err(ExtractError::PartialFailure { schema, reason }) => {
                    warn!(schema = %schema, reason = %reason, "schema skipped");
                    builder.skip_schema(&schema, reason);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        let inventory = builder
            .finish()
            .map_err(|e| ExtractError::Fatal(e.to_string()))?;
        info!(
            connection_id = %connection.id,
            source = %self.dialect,
            objects = inventory.summary.total,
            skipped_schemas = inventory.skipped_schemas.len(),
            "inventory extracted"
        );
        Ok(inventory)
    }

    async fn fetch_ddl(
        &self,
        source: &SourceHandle,
        schema: &str,
        object: &str,
    ) -> Result<String, ExtractError> {
        let session = source.session.as_ref();
        let database = source.connection.database.as_str();
        let mut failures = Vec::new();

        match self.table_ddl(session, database, schema, object).await {
            Ok(Some(ddl)) => return Ok(ddl),
            Ok(None) => {}
            Err(e) => failures.push(e.0),
        }
        match self.columns(session, database, schema, object).await {
            Ok(columns) if !columns.is_empty() => {
                return Ok(synthesize_create_table(
                    &format!("{schema}.{object}"),
                    &columns,
                ))
            }
            Ok(_) => {}
            Err(e) => failures.push(e.0),
        }
        match self.view_definition(source, schema, object).await {
            Ok(Some(ddl)) => return Ok(ddl),
            Ok(None) => {}
            Err(e) => failures.push(e.0),
        }

        let mut reason = format!("no DDL available for {schema}.{object}");
        if !failures.is_empty() {
            reason.push_str(": ");
            reason.push_str(&failures.join("; "));
        }
        Err(ExtractError::Fatal(reason))
    }
}

fn issue(schema: &str, object: Option<&str>, scope: &str, err: QueryError) -> ExtractIssue {
    ExtractIssue {
        schema: schema.to_string(),
        object: object.map(str::to_string),
        scope: scope.to_string(),
        reason: err.0,
    }
}

fn routine_type(kind: &str) -> ObjectType {
    if kind.trim().eq_ignore_ascii_case("function") {
        ObjectType::Function
    } else {
        ObjectType::Procedure
    }
}

fn view_statement(schema: &str, name: &str, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return String::new();
    }
    let head = body
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if head == "CREATE" || head == "REPLACE" {
        body.to_string()
    } else {
        format!("CREATE VIEW {schema}.{name} AS\n{body}")
    }
}

fn cell_u32(row: &SourceRow, index: usize) -> Option<u32> {
    match row.at(index)? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn count_value(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64() != Some(0),
        serde_json::Value::String(s) => {
            matches!(s.trim().to_ascii_uppercase().as_str(), "Y" | "YES" | "TRUE" | "1")
        }
        _ => true,
    }
}

fn render_type(column: &ColumnInfo) -> String {
    let base = column.source_type.as_str();
    if base.contains('(') {
        return base.to_string();
    }
    let upper = base.to_ascii_uppercase();
    let numeric = upper.contains("DEC") || upper.contains("NUM");
    let sized = upper.contains("CHAR") || upper.contains("BINARY");
    match (column.precision, column.scale, column.length) {
        (Some(p), Some(s), _) if numeric || s > 0 => format!("{base}({p},{s})"),
        (Some(p), None, _) if numeric => format!("{base}({p})"),
        (_, _, Some(len)) if sized => format!("{base}({len})"),
        _ => base.to_string(),
    }
}

/// Build a `CREATE TABLE` statement from catalog column metadata.
pub fn synthesize_create_table(qualified_name: &str, columns: &[ColumnInfo]) -> String {
    let body = columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("    {} {}{}", c.name, render_type(c), null)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE {qualified_name} (\n{body}\n)")
}
