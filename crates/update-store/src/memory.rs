//! In-memory storage backend, used by tests and ephemeral nodes

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use node_core::{Error, Result};
use tracing::instrument;

use crate::StorageBackend;

/// Storage backend holding every object in a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Bytes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;
        self.objects.insert(path.to_string(), data);
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
