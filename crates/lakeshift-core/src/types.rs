use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::ConnectError;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                $name(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Return a short prefix (first 8 chars) for display.
            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

opaque_id!(
    /// Opaque handle for a registered source connection.
    ConnectionId
);
opaque_id!(
    /// Identifier of a single migration run.
    RunId
);
opaque_id!(
    /// Identifier of a schedule (job).
    JobId
);
opaque_id!(
    /// Identifier of an execution ledger row.
    ExecutionId
);

/// The legacy warehouse dialects a migration can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDialect {
    Oracle,
    Snowflake,
    SqlServer,
    Teradata,
    Netezza,
    Synapse,
    Redshift,
    MySql,
}

impl SourceDialect {
    pub const ALL: [SourceDialect; 8] = [
        SourceDialect::Oracle,
        SourceDialect::Snowflake,
        SourceDialect::SqlServer,
        SourceDialect::Teradata,
        SourceDialect::Netezza,
        SourceDialect::Synapse,
        SourceDialect::Redshift,
        SourceDialect::MySql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDialect::Oracle => "oracle",
            SourceDialect::Snowflake => "snowflake",
            SourceDialect::SqlServer => "sqlserver",
            SourceDialect::Teradata => "teradata",
            SourceDialect::Netezza => "netezza",
            SourceDialect::Synapse => "synapse",
            SourceDialect::Redshift => "redshift",
            SourceDialect::MySql => "mysql",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceDialect::Oracle => "Oracle Database",
            SourceDialect::Snowflake => "Snowflake",
            SourceDialect::SqlServer => "Microsoft SQL Server",
            SourceDialect::Teradata => "Teradata",
            SourceDialect::Netezza => "IBM Netezza",
            SourceDialect::Synapse => "Azure Synapse Analytics",
            SourceDialect::Redshift => "Amazon Redshift",
            SourceDialect::MySql => "MySQL",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            SourceDialect::Oracle => 1521,
            SourceDialect::Snowflake => 443,
            SourceDialect::SqlServer | SourceDialect::Synapse => 1433,
            SourceDialect::Teradata => 1025,
            SourceDialect::Netezza => 5480,
            SourceDialect::Redshift => 5439,
            SourceDialect::MySql => 3306,
        }
    }

    /// JDBC URL used by direct-driver connectors.
    pub fn jdbc_url(
        &self,
        host: &str,
        port: u16,
        database: &str,
        params: &BTreeMap<String, String>,
    ) -> String {
        match self {
            SourceDialect::Oracle => format!("jdbc:oracle:thin:@{host}:{port}/{database}"),
            SourceDialect::Snowflake => {
                let warehouse = params
                    .get("warehouse")
                    .map(String::as_str)
                    .unwrap_or("COMPUTE_WH");
                format!("jdbc:snowflake://{host}/?db={database}&warehouse={warehouse}")
            }
            SourceDialect::SqlServer | SourceDialect::Synapse => format!(
                "jdbc:sqlserver://{host}:{port};databaseName={database};encrypt=true;trustServerCertificate=true"
            ),
            SourceDialect::Teradata => format!("jdbc:teradata://{host}/DATABASE={database}"),
            SourceDialect::Netezza => format!("jdbc:netezza://{host}:{port}/{database}"),
            SourceDialect::Redshift => format!("jdbc:redshift://{host}:{port}/{database}"),
            SourceDialect::MySql => format!("jdbc:mysql://{host}:{port}/{database}?useSSL=true"),
        }
    }
}

impl fmt::Display for SourceDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceDialect {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        SourceDialect::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == lowered)
            .ok_or_else(|| ConnectError::UnsupportedDialect(s.to_string()))
    }
}

/// How a source connection was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    /// Through a lakehouse federation connection.
    Federated,
    /// Through the dialect's own driver.
    Direct,
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMethod::Federated => write!(f, "federated"),
            ConnectionMethod::Direct => write!(f, "direct"),
        }
    }
}

/// Kind of schema object carried in an inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Table,
    View,
    Procedure,
    Function,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Table => write!(f, "table"),
            ObjectType::View => write!(f, "view"),
            ObjectType::Procedure => write!(f, "procedure"),
            ObjectType::Function => write!(f, "function"),
        }
    }
}

/// Terminal status of one object within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    Success,
    Error,
    Skipped,
}

/// Why an object was skipped instead of migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cancelled,
    RunAborted,
    Excluded,
    NoSourceSql,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::RunAborted => write!(f, "run_aborted"),
            SkipReason::Excluded => write!(f, "excluded"),
            SkipReason::NoSourceSql => write!(f, "no_source_sql"),
        }
    }
}

/// Lifecycle status of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Scheduled,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggeredBy::Manual => write!(f, "manual"),
            TriggeredBy::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggeredBy::Manual),
            "scheduled" => Ok(TriggeredBy::Scheduled),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}
