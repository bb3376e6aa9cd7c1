//! Engine configuration.
//!
//! Defaults suit a single operator workstation; every field can be set from a
//! JSON file and overridden with `LAKESHIFT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::ObjectType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum object pipelines running at once within one run.
    pub max_concurrency: usize,
    /// Per-call timeout for translate, validate and execute.
    pub call_timeout_secs: u64,
    /// Timeout for each connection handshake attempt.
    pub connect_timeout_secs: u64,
    /// Interval between scheduler ticks.
    pub scheduler_tick_secs: u64,
    /// Run log lines kept per run.
    pub run_log_capacity: usize,
    /// Object kinds the pipeline skips without translating.
    pub excluded_object_types: Vec<ObjectType>,
    /// Record `COUNT(*)` per table during extraction.
    pub count_table_rows: bool,
    /// SQLite ledger location (`:memory:` for a volatile ledger).
    pub ledger_path: String,
    /// Root directory for inventory snapshots and error reports.
    pub artifact_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout_secs: 120,
            connect_timeout_secs: 30,
            scheduler_tick_secs: 30,
            run_log_capacity: 1000,
            excluded_object_types: Vec::new(),
            count_table_rows: false,
            ledger_path: "lakeshift.db".to_string(),
            artifact_root: PathBuf::from("lakeshift-artifacts"),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `LAKESHIFT_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        self.validate()?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LAKESHIFT_MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("LAKESHIFT_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("LAKESHIFT_CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = parse_var("LAKESHIFT_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("LAKESHIFT_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = parse_var("LAKESHIFT_CONNECT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("LAKESHIFT_SCHEDULER_TICK_SECS") {
            self.scheduler_tick_secs = parse_var("LAKESHIFT_SCHEDULER_TICK_SECS", &v)?;
        }
        if let Some(v) = lookup("LAKESHIFT_RUN_LOG_CAPACITY") {
            self.run_log_capacity = parse_var("LAKESHIFT_RUN_LOG_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("LAKESHIFT_COUNT_TABLE_ROWS") {
            self.count_table_rows = parse_var("LAKESHIFT_COUNT_TABLE_ROWS", &v)?;
        }
        if let Some(v) = lookup("LAKESHIFT_LEDGER_PATH") {
            self.ledger_path = v;
        }
        if let Some(v) = lookup("LAKESHIFT_ARTIFACT_ROOT") {
            self.artifact_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("LAKESHIFT_EXCLUDED_OBJECT_TYPES") {
            self.excluded_object_types = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
                        .map_err(|_| {
                            EngineError::Config(format!(
                                "LAKESHIFT_EXCLUDED_OBJECT_TYPES: unknown object type {s}"
                            ))
                        })
                })
                .collect::<Result<Vec<ObjectType>>>()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be at least 1".into()));
        }
        if self.call_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(EngineError::Config("timeouts must be non-zero".into()));
        }
        if self.scheduler_tick_secs == 0 {
            return Err(EngineError::Config("scheduler_tick_secs must be non-zero".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{key}: cannot parse {value:?}")))
}
