use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use crate::{ObjectStore, StoreError};

/// Filesystem-backed bucket. Keys are relative paths under `root`; `put`
/// writes to `<root>/.tmp-<key>-<uuid>` and renames into place so a reader
/// racing the write always sees either the old or the new content.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(e.to_string())
            }
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let dest = self.resolve(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let tmp_name = format!(
            ".tmp-{}-{}",
            dest.file_name().and_then(|n| n.to_str()).unwrap_or("obj"),
            Uuid::new_v4()
        );
        let tmp_path: PathBuf = dest
            .parent()
            .map(|p| p.join(&tmp_name))
            .unwrap_or_else(|| PathBuf::from(&tmp_name));

        fs::write(&tmp_path, &value)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &dest)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tracing::debug!(key, bytes = value.len(), "object written atomically");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir_path = self.resolve_prefix_dir(prefix);
        let mut entries = match fs::read_dir(&dir_path).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".tmp-") {
                continue;
            }
            let key = if prefix.is_empty() || prefix.ends_with('/') {
                format!("{prefix}{name}")
            } else {
                format!("{prefix}/{name}")
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl FsObjectStore {
    fn resolve_prefix_dir(&self, prefix: &str) -> PathBuf {
        let as_path = Path::new(prefix);
        match as_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => self.root.join(p),
            _ => self.root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("static_config.json", b"{}".to_vec()).await.unwrap();
        let got = store.get("static_config.json").await.unwrap();
        assert_eq!(got, b"{}");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store.get("missing.json").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_hides_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("schedule_fn-a.json", b"{}".to_vec()).await.unwrap();
        store.put("schedule_fn-b.json", b"{}".to_vec()).await.unwrap();
        store.put("carbon_forecasts.json", b"{}".to_vec()).await.unwrap();

        let mut keys = store.list("schedule_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["schedule_fn-a.json", "schedule_fn-b.json"]);
    }

    #[tokio::test]
    async fn overwrite_replaces_content_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("k", b"v1".to_vec()).await.unwrap();
        store.put("k", b"v2".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v2");
    }
}
