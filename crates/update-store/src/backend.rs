//! Storage backend trait definition
//!
//! Defines the async interface that all storage backends must implement.

use async_trait::async_trait;
use bytes::Bytes;
use node_core::Result;

/// Async trait for storage backends
///
/// Keys are `/`-separated relative paths such as
/// `repo/session/3/aggregate.json`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the object stored under `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write `data` under `path`, replacing any previous object
    ///
    /// Writers must never leave a partially written object visible.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the object under `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
