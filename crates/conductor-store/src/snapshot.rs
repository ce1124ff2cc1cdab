use crate::checkpoint::validate_name;
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use std::path::PathBuf;

/// Minimal load/save contract for point-in-time state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, key: &str, value: &serde_json::Value) -> ConductorResult<()>;
    async fn load(&self, key: &str) -> ConductorResult<Option<serde_json::Value>>;
    async fn delete(&self, key: &str) -> ConductorResult<()>;
    async fn list(&self) -> ConductorResult<Vec<String>>;
}

/// File-based snapshot store (one JSON file per key).
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous snapshot intact.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Store under `dir`, which is created if missing.
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, key: &str, value: &serde_json::Value) -> ConductorResult<()> {
        validate_name(key)?;
        let path = self.snapshot_path(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> ConductorResult<Option<serde_json::Value>> {
        validate_name(key)?;
        let path = self.snapshot_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let value = serde_json::from_str(&data)
            .map_err(|e| ConductorError::Store(format!("Failed to parse snapshot '{key}': {e}")))?;
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> ConductorResult<()> {
        validate_name(key)?;
        let path = self.snapshot_path(key);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> ConductorResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with('.') {
                    continue;
                }
                if let Some(stem) = name.strip_suffix(".json") {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_load_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();

        store
            .save("queue", &serde_json::json!({"tasks": [1, 2]}))
            .await
            .unwrap();
        store
            .save("queue", &serde_json::json!({"tasks": [3]}))
            .await
            .unwrap();

        let loaded = store.load("queue").await.unwrap().unwrap();
        assert_eq!(loaded["tasks"], serde_json::json!([3]));
        assert_eq!(store.list().await.unwrap(), vec!["queue"]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_store_error() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("queue.json"), "{oops")
            .await
            .unwrap();
        let err = store.load("queue").await.unwrap_err();
        assert!(matches!(err, ConductorError::Store(_)));
    }

    #[tokio::test]
    async fn invalid_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        assert!(store.save("a/b", &serde_json::json!(1)).await.is_err());
        assert!(store.load(".hidden").await.is_err());
    }
}
