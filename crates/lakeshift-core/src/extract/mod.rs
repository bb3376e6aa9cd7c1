//! Inventory extraction: one [`Extractor`] per source dialect.

pub mod catalog;
pub mod queries;

pub use catalog::CatalogExtractor;
pub use queries::{CatalogQueries, CatalogQuery, ColumnLayout, QueryStyle};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::SourceHandle;
use crate::error::ExtractError;
use crate::inventory::Inventory;
use crate::types::SourceDialect;

/// Reads a source catalog into an [`Inventory`].
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract every migratable object, optionally restricted to `schema_filter`.
    ///
    /// Unreadable schemas are recorded in the inventory instead of failing the call.
    async fn extract(
        &self,
        source: &SourceHandle,
        schema_filter: Option<&[String]>,
    ) -> Result<Inventory, ExtractError>;

    /// Source DDL for a single object.
    async fn fetch_ddl(
        &self,
        source: &SourceHandle,
        schema: &str,
        object: &str,
    ) -> Result<String, ExtractError>;
}

/// Maps each dialect to the extractor that reads it.
#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<SourceDialect, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the query-driven catalog extractor for every dialect.
    pub fn with_catalog_defaults() -> Self {
        Self::with_catalog(false)
    }

    /// Catalog extractors for every dialect, optionally counting table rows.
    pub fn with_catalog(count_rows: bool) -> Self {
        let mut registry = Self::new();
        for dialect in SourceDialect::ALL {
            let extractor = CatalogExtractor::for_dialect(dialect).with_row_counts(count_rows);
            registry.register(dialect, Arc::new(extractor));
        }
        registry
    }

    /// Install `extractor` for `dialect`, replacing any previous one.
    pub fn register(&mut self, dialect: SourceDialect, extractor: Arc<dyn Extractor>) {
        self.extractors.insert(dialect, extractor);
    }

    pub fn get(&self, dialect: SourceDialect) -> Result<Arc<dyn Extractor>, ExtractError> {
        self.extractors
            .get(&dialect)
            .cloned()
            .ok_or_else(|| ExtractError::Fatal(format!("no extractor registered for {dialect}")))
    }

    pub async fn extract(
        &self,
        source: &SourceHandle,
        schema_filter: Option<&[String]>,
    ) -> Result<Inventory, ExtractError> {
        self.get(source.connection.source_type)?
            .extract(source, schema_filter)
            .await
    }

    pub async fn fetch_ddl(
        &self,
        source: &SourceHandle,
        schema: &str,
        object: &str,
    ) -> Result<String, ExtractError> {
        self.get(source.connection.source_type)?
            .fetch_ddl(source, schema, object)
            .await
    }
}
