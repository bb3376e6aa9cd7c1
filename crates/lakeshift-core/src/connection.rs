//! Connection registry: volatile map of live source sessions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{ConnectError, QueryError};
use crate::pipeline::saturating_millis;
use crate::types::{ConnectionId, ConnectionMethod, SourceDialect};

/// A password or token. Never serialized, redacted in `Debug`.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Everything needed to attempt a source handshake.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub source_type: SourceDialect,
    pub host: String,
    /// `None` resolves to the dialect's default port.
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub password: Secret,
    /// Force one method; `None` tries federation first, then direct.
    pub method: Option<ConnectionMethod>,
    pub additional_params: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.source_type.default_port())
    }

    pub fn jdbc_url(&self) -> String {
        self.source_type
            .jdbc_url(&self.host, self.port(), &self.database, &self.additional_params)
    }
}

/// A registered source connection. Holds no credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_type: SourceDialect,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub connection_method: ConnectionMethod,
    pub created_at: DateTime<Utc>,
}

/// One row returned by a catalog query, columns in result order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    columns: Vec<(String, Value)>,
}

impl SourceRow {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        SourceRow { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// First column whose name matches any of `names`, case-insensitively.
    pub fn get(&self, names: &[&str]) -> Option<&Value> {
        names.iter().find_map(|name| {
            self.columns
                .iter()
                .find(|(col, _)| col.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, v)| v)
    }

    pub fn last(&self) -> Option<&Value> {
        self.columns.last().map(|(_, v)| v)
    }

    pub fn get_str(&self, names: &[&str]) -> Option<String> {
        self.get(names).and_then(value_to_string)
    }
}

/// Render a scalar cell as text; `None` for nulls, arrays and objects.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A live session against a source warehouse.
#[async_trait]
pub trait SourceSession: Send + Sync {
    /// Run a read-only catalog query with named bind parameters.
    async fn query(
        &self,
        sql: &str,
        binds: &[(&str, String)],
    ) -> std::result::Result<Vec<SourceRow>, QueryError>;
}

/// Opens sessions against source warehouses.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Whether this connector can reach `dialect` at all.
    fn supports(&self, _dialect: SourceDialect) -> bool {
        true
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        method: ConnectionMethod,
    ) -> std::result::Result<Arc<dyn SourceSession>, ConnectError>;
}

/// A registered connection together with its live session.
#[derive(Clone)]
pub struct SourceHandle {
    pub connection: Connection,
    pub session: Arc<dyn SourceSession>,
}

pub struct ConnectionRegistry {
    connector: Arc<dyn SourceConnector>,
    connect_timeout: Duration,
    entries: RwLock<HashMap<ConnectionId, SourceHandle>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn SourceConnector>, connect_timeout: Duration) -> Self {
        ConnectionRegistry {
            connector,
            connect_timeout,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Handshake with the source and register it under a fresh id.
    ///
    /// Nothing is stored when every attempted method fails.
    pub async fn test_connection(
        &self,
        config: &ConnectionConfig,
    ) -> std::result::Result<Connection, ConnectError> {
        if !self.connector.supports(config.source_type) {
            return Err(ConnectError::UnsupportedDialect(
                config.source_type.to_string(),
            ));
        }

        let methods: &[ConnectionMethod] = match config.method {
            Some(ConnectionMethod::Federated) => &[ConnectionMethod::Federated],
            Some(ConnectionMethod::Direct) => &[ConnectionMethod::Direct],
            None => &[ConnectionMethod::Federated, ConnectionMethod::Direct],
        };

        let mut last_err = None;
        for &method in methods {
            match self.attempt(config, method).await {
                Ok(session) => {
                    let connection = Connection {
                        id: ConnectionId::generate(),
                        source_type: config.source_type,
                        host: config.host.clone(),
                        port: config.port(),
                        database: config.database.clone(),
                        connection_method: method,
                        created_at: Utc::now(),
                    };
                    info!(
                        connection_id = %connection.id,
                        source = %config.source_type,
                        host = %config.host,
                        method = %method,
                        "source connection registered"
                    );
                    self.entries.write().await.insert(
                        connection.id.clone(),
                        SourceHandle {
                            connection: connection.clone(),
                            session,
                        },
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(
                        source = %config.source_type,
                        host = %config.host,
                        method = %method,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ConnectError::HostUnreachable(format!("{}:{}", config.host, config.port()))
        }))
    }

    async fn attempt(
        &self,
        config: &ConnectionConfig,
        method: ConnectionMethod,
    ) -> std::result::Result<Arc<dyn SourceSession>, ConnectError> {
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(config, method))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout {
                after_ms: saturating_millis(self.connect_timeout),
            }),
        }
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|h| h.connection.clone())
    }

    /// The registered connection with its live session.
    pub async fn handle(&self, id: &ConnectionId) -> Option<SourceHandle> {
        self.entries.read().await.get(id).cloned()
    }

    /// All registered connections, oldest first.
    pub async fn list(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = self
            .entries
            .read()
            .await
            .values()
            .map(|h| h.connection.clone())
            .collect();
        connections.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        connections
    }

    /// Drop a connection. Returns whether it was registered.
    pub async fn forget(&self, id: &ConnectionId) -> bool {
        let removed = self.entries.write().await.remove(id).is_some();
        if removed {
            info!(connection_id = %id, "source connection forgotten");
        }
        removed
    }
}
