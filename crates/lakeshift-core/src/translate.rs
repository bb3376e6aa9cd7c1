use async_trait::async_trait;

use crate::error::TranslateError;
use crate::types::{ObjectType, SourceDialect};

/// Input to one dialect translation.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub object_type: ObjectType,
    pub source_sql: &'a str,
    pub source_dialect: SourceDialect,
    pub target_catalog: &'a str,
    pub target_schema: &'a str,
}

/// Turns source-dialect SQL into target SQL. Typically backed by a language model.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, request: TranslationRequest<'_>) -> Result<String, TranslateError>;
}

/// Trim translator output and unwrap a surrounding Markdown code fence.
///
/// Empty output is `InvalidOutput`.
pub fn clean_translation(raw: &str) -> Result<String, TranslateError> {
    let mut sql = raw.trim();
    if let Some(rest) = sql.strip_prefix("```") {
        // Drop the info string (`sql`, `databricks`, ...) on the opening line.
        sql = match rest.find('\n') {
            Some(idx) if rest[..idx].chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') => {
                &rest[idx + 1..]
            }
            Some(_) => rest,
            None => rest.trim_start_matches(|c: char| c.is_alphanumeric()),
        };
        sql = sql.trim_end();
        if let Some(body) = sql.strip_suffix("```") {
            sql = body;
        }
        sql = sql.trim();
    }
    if sql.is_empty() {
        return Err(TranslateError::InvalidOutput(
            "translator returned no SQL".to_string(),
        ));
    }
    Ok(sql.to_string())
}
