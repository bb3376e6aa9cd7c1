//! Opaque-handle storage for inventory snapshots and error reports.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::inventory::Inventory;

/// Address of a stored artifact. Callers treat it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(pub String);

impl ArtifactHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactHandle {
    fn from(s: &str) -> Self {
        ArtifactHandle(s.to_string())
    }
}

/// Trait for pluggable artifact storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes under a relative key, replacing any previous content.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactHandle>;

    async fn get(&self, handle: &ArtifactHandle) -> Result<Option<Vec<u8>>>;

    /// Handles whose key starts with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactHandle>>;
}

fn check_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(format!(
            "artifact key must be a relative path without '..': {key}"
        )))
    }
}

/// Artifacts as files under a root directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsArtifactStore { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactHandle> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write beside the target and rename so readers never see a torn file.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(ArtifactHandle(key.to_string()))
    }

    async fn get(&self, handle: &ArtifactHandle) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(handle.as_str())?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactHandle>> {
        let mut handles = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.contains(".tmp-") {
                    handles.push(ArtifactHandle(key));
                }
            }
        }
        handles.sort();
        Ok(handles)
    }
}

/// Volatile artifact store, for tests and throwaway engines.
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactHandle> {
        check_key(key)?;
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(ArtifactHandle(key.to_string()))
    }

    async fn get(&self, handle: &ArtifactHandle) -> Result<Option<Vec<u8>>> {
        check_key(handle.as_str())?;
        Ok(self.entries.read().await.get(handle.as_str()).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactHandle>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| ArtifactHandle(k.clone()))
            .collect())
    }
}

/// Saves and loads inventory snapshots through an [`ArtifactStore`].
#[derive(Clone)]
pub struct InventoryStore {
    artifacts: Arc<dyn ArtifactStore>,
}

impl InventoryStore {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        InventoryStore { artifacts }
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub async fn save(&self, inventory: &Inventory) -> Result<ArtifactHandle> {
        let database: String = inventory
            .source_database
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let key = format!(
            "inventories/{}_{}_{}_{}/inventory.json",
            inventory.source_type,
            database,
            inventory.extracted_at.format("%Y%m%d_%H%M%S"),
            &inventory.id[..8.min(inventory.id.len())],
        );
        let bytes = serde_json::to_vec_pretty(inventory)?;
        self.artifacts.put(&key, bytes).await
    }

    pub async fn load(&self, handle: &ArtifactHandle) -> Result<Inventory> {
        let bytes = self
            .artifacts
            .get(handle)
            .await?
            .ok_or_else(|| EngineError::ArtifactNotFound(handle.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn list(&self) -> Result<Vec<ArtifactHandle>> {
        Ok(self
            .artifacts
            .list("inventories/")
            .await?
            .into_iter()
            .filter(|h| h.as_str().ends_with("/inventory.json"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryBuilder, InventoryItem};
    use crate::types::{ConnectionId, ObjectType, SourceDialect};

    fn sample_inventory() -> Inventory {
        let mut builder =
            InventoryBuilder::new(ConnectionId::from("c1"), SourceDialect::Teradata, "EDW/PROD");
        builder.add_schema(
            "finance",
            vec![InventoryItem {
                schema: "finance".into(),
                name: "ledger".into(),
                object_type: ObjectType::Table,
                source_definition: "CREATE TABLE finance.ledger (id INTEGER)".into(),
                columns: vec![],
                row_count: None,
            }],
        );
        builder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let handle = store.put("reports/a.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get(&handle).await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(
            store.get(&ArtifactHandle::from("reports/missing.json")).await.unwrap(),
            None
        );
        assert_eq!(store.list("reports/").await.unwrap(), vec![handle]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let store = MemoryArtifactStore::new();
        assert!(store.put("../etc/passwd", vec![]).await.is_err());
        assert!(store.put("/abs/path", vec![]).await.is_err());
        assert!(store.put("", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_both_stores_reject_escaping_reads() {
        let dir = tempfile::tempdir().unwrap();
        let stores: Vec<Box<dyn ArtifactStore>> = vec![
            Box::new(MemoryArtifactStore::new()),
            Box::new(FsArtifactStore::new(dir.path())),
        ];
        for store in &stores {
            for key in ["../etc/passwd", "/abs/path", "", "runs/../../x"] {
                let err = store.get(&ArtifactHandle::from(key)).await.unwrap_err();
                assert_eq!(err.kind(), "invalid_argument", "key {key:?}");
            }
            assert_eq!(store.get(&ArtifactHandle::from("runs/missing.json")).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_inventory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(Arc::new(FsArtifactStore::new(dir.path())));
        let inventory = sample_inventory();

        let handle = store.save(&inventory).await.unwrap();
        assert!(handle.as_str().starts_with("inventories/teradata_EDW_PROD_"));
        assert!(handle.as_str().ends_with("/inventory.json"));

        let loaded = store.load(&handle).await.unwrap();
        assert_eq!(loaded, inventory);
        assert_eq!(store.list().await.unwrap(), vec![handle]);
    }

    #[tokio::test]
    async fn test_missing_inventory() {
        let store = InventoryStore::new(Arc::new(MemoryArtifactStore::new()));
        let err = store
            .load(&ArtifactHandle::from("inventories/none/inventory.json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "artifact_not_found");
    }
}
