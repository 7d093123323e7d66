//! Local filesystem storage backend
//!
//! Objects are files under a root directory. Writes go to a hidden temp file
//! that is synced and then renamed over the target.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use node_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the filesystem, refusing anything that escapes the root
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::InvalidStorageKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn staging_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
    }

    async fn walk(&self, start: PathBuf, prefix: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !file_type.is_file() || hidden {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        found.push(key);
                    }
                }
            }
        }

        found.sort();
        found
    }
}

fn storage_error(action: &str, key: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: key.to_string(),
        }
    } else {
        Error::Storage {
            message: format!("failed to {action} {key}: {e}"),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let target = self.resolve(path)?;
        let data = fs::read(&target)
            .await
            .map_err(|e| storage_error("read", path, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.resolve(path)?;
        let staging = Self::staging_path(&target);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Error::Storage {
                message: format!("failed to create {}: {e}", parent.display()),
            })?;
        }

        let mut file = fs::File::create(&staging)
            .await
            .map_err(|e| storage_error("stage", path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| storage_error("write", path, e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error("sync", path, e))?;

        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(storage_error("publish", path, e));
        }

        debug!(path, size = data.len(), "Object written");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        fs::remove_file(&target)
            .await
            .map_err(|e| storage_error("delete", path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(fs::metadata(&target).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk from the deepest directory the prefix fully names
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.resolve(dir_part)?;
        let keys = self.walk(start, prefix).await;
        debug!(prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn test_write_and_read_nested() {
        let (_dir, storage) = setup();
        let data = Bytes::from(r#"{"round": 1}"#);

        let written = storage
            .write("repo-1/session-a/1/aggregate.json", data.clone())
            .await
            .unwrap();
        assert_eq!(written, data.len() as u64);

        let read = storage.read("repo-1/session-a/1/aggregate.json").await.unwrap();
        assert_eq!(read, data);
        assert!(storage.exists("repo-1/session-a/1/aggregate.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let (_dir, storage) = setup();

        let result = storage.read("repo-1/none.json").await;
        assert!(matches!(result, Err(Error::StoragePathNotFound { .. })));

        let result = storage.delete("repo-1/none.json").await;
        assert!(matches!(result, Err(Error::StoragePathNotFound { .. })));
        assert!(!storage.exists("repo-1/none.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_dir, storage) = setup();

        let result = storage.write("../outside.json", Bytes::from("x")).await;
        assert!(matches!(result, Err(Error::InvalidStorageKey { .. })));
        assert!(!result.unwrap_err().is_retryable());
        assert!(storage.read("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let (_dir, storage) = setup();

        for key in [
            "repo-1/s1/1/aggregate.json",
            "repo-1/s1/2/aggregate.json",
            "repo-1/s1/events/a.json",
            "repo-2/s9/1/aggregate.json",
        ] {
            storage.write(key, Bytes::from("{}")).await.unwrap();
        }

        let repo_one = storage.list("repo-1/s1/").await.unwrap();
        assert_eq!(
            repo_one,
            vec![
                "repo-1/s1/1/aggregate.json",
                "repo-1/s1/2/aggregate.json",
                "repo-1/s1/events/a.json",
            ]
        );
        assert_eq!(storage.list("repo-2").await.unwrap().len(), 1);
        assert_eq!(storage.list("").await.unwrap().len(), 4);
        assert!(storage.list("repo-3/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_staging_files_left() {
        let (dir, storage) = setup();
        storage.write("model.json", Bytes::from("[]")).await.unwrap();
        storage.write("model.json", Bytes::from("[[1]]")).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(storage.read("model.json").await.unwrap(), Bytes::from("[[1]]"));
    }
}
