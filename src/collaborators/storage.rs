use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::CollaboratorError;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Write a JSON document at a relative, slash-separated path. Existing
    /// blobs are overwritten.
    async fn write_blob(&self, path: &str, json: &serde_json::Value) -> Result<(), CollaboratorError>;
}

/// Blobs as pretty-printed JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, CollaboratorError> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(CollaboratorError::InvalidId(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn write_blob(&self, path: &str, json: &serde_json::Value) -> Result<(), CollaboratorError> {
        let target = self.resolve(path)?;
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec_pretty(json)?;
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &target).await?;
        debug!(path = %target.display(), "blob written");
        Ok(())
    }
}

/// Blob storage kept in memory; tests read blobs back with [`get`](Self::get).
#[derive(Default)]
pub struct InMemoryBlobStorage {
    blobs: Mutex<HashMap<String, serde_json::Value>>,
}

impl InMemoryBlobStorage {
    pub async fn get(&self, path: &str) -> Option<serde_json::Value> {
        self.blobs.lock().await.get(path).cloned()
    }

    pub async fn paths(&self) -> Vec<String> {
        let mut p: Vec<String> = self.blobs.lock().await.keys().cloned().collect();
        p.sort();
        p
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn write_blob(&self, path: &str, json: &serde_json::Value) -> Result<(), CollaboratorError> {
        self.blobs.lock().await.insert(path.to_string(), json.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fs_blob_is_written_as_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path());
        storage
            .write_blob("claims/C-1/report.json", &json!({"claimId": "C-1"}))
            .await
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("claims/C-1/report.json")).unwrap();
        assert!(text.contains('\n'));
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["claimId"], "C-1");
    }

    #[tokio::test]
    async fn fs_blob_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path());
        for bad in ["../escape.json", "/etc/passwd", ""] {
            let err = storage.write_blob(bad, &json!({})).await.unwrap_err();
            assert!(matches!(err, CollaboratorError::InvalidId(_)), "{bad}");
        }
    }
}
