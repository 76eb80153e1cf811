use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ControlError, Result};

/// Name of the log file every managed server writes in its root.
pub const LOG_FILE_NAME: &str = "server.log";

/// One managed server as seen by the control plane.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerRecord {
    #[serde(skip)]
    pub key: String,
    /// Resolved root used for every filesystem operation.
    #[serde(skip)]
    pub root_path: PathBuf,
    /// `path` exactly as the registry declares it; this is what listings show.
    #[serde(rename = "path")]
    pub declared_path: PathBuf,
    pub port: u16,
}

impl ServerRecord {
    pub fn new(key: impl Into<String>, root_path: impl Into<PathBuf>, port: u16) -> Self {
        let root_path = root_path.into();
        Self {
            key: key.into(),
            declared_path: root_path.clone(),
            root_path,
            port,
        }
    }

    /// Record whose declared path differs from the resolved root.
    pub fn declared(
        key: impl Into<String>,
        declared_path: impl Into<PathBuf>,
        root_path: impl Into<PathBuf>,
        port: u16,
    ) -> Self {
        Self {
            key: key.into(),
            root_path: root_path.into(),
            declared_path: declared_path.into(),
            port,
        }
    }
}

/// On-disk shape of one registry entry.
#[derive(Debug, Clone, Deserialize)]
struct RegistryEntry {
    path: PathBuf,
    port: u16,
}

/// Read-only source of server records. Implementations must not cache:
/// every call reflects the current registry state.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    async fn snapshot(&self) -> Result<BTreeMap<String, ServerRecord>>;

    async fn resolve(&self, key: &str) -> Result<ServerRecord> {
        self.snapshot()
            .await?
            .remove(key)
            .ok_or_else(|| ControlError::NotFound(key.to_string()))
    }
}

/// Registry backed by a JSON file, re-read on every access.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative server paths are resolved against.
    fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn parse_registry(content: &str, base_dir: &Path) -> Result<BTreeMap<String, ServerRecord>> {
    let entries: BTreeMap<String, RegistryEntry> = serde_json::from_str(content)
        .map_err(|e| ControlError::Internal(format!("Failed to parse server registry: {}", e)))?;

    Ok(entries
        .into_iter()
        .map(|(key, entry)| {
            let root = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                base_dir.join(&entry.path)
            };
            let record = ServerRecord::declared(key.clone(), entry.path, root, entry.port);
            (key, record)
        })
        .collect())
}

#[async_trait]
impl ServerRegistry for FileRegistry {
    async fn snapshot(&self) -> Result<BTreeMap<String, ServerRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ControlError::Internal(format!(
                "Failed to read server registry {}: {}",
                self.path.display(),
                e
            ))
        })?;
        parse_registry(&content, &self.base_dir())
    }
}

/// Fixed in-memory registry, used for embedding and tests.
#[derive(Default)]
pub struct StaticRegistry {
    records: BTreeMap<String, ServerRecord>,
}

impl StaticRegistry {
    pub fn new(records: impl IntoIterator<Item = ServerRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.key.clone(), r)).collect(),
        }
    }
}

#[async_trait]
impl ServerRegistry for StaticRegistry {
    async fn snapshot(&self) -> Result<BTreeMap<String, ServerRecord>> {
        Ok(self.records.clone())
    }
}
