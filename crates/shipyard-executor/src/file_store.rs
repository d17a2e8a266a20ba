//! Parameter store backed by a JSON file.
//!
//! Lets a deploy process running separately from the pipeline pick up the
//! latest image tag through the filesystem.

use async_trait::async_trait;
use shipyard_core::parameter::ParameterStore;
use shipyard_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// A parameter store persisted as a flat JSON object.
pub struct FileParameterStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileParameterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::InvalidInput(format!("{}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    async fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(values).map_err(|e| Error::Internal(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            Error::Permission(format!("{}: {}", path.display(), err))
        }
        _ => Error::Internal(format!("{}: {}", path.display(), err)),
    }
}

#[async_trait]
impl ParameterStore for FileParameterStore {
    async fn put(&self, key: &str, value: &str, overwrite: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        if !overwrite && values.contains_key(key) {
            return Err(Error::Conflict(format!("parameter '{}' already exists", key)));
        }
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await?;
        debug!(key = %key, path = %self.path.display(), "Parameter written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.load()
            .await?
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("parameter '{}'", key)))
    }
}
