//! Update Store - persistence collaborators for the cloud node
//!
//! Provides:
//! - Pluggable storage backends (local filesystem, in-memory)
//! - A background writer that applies writes in order with retries
//! - Durable checkpoints of round aggregates and a session event log
//! - Model hosting for clients that download weights per round
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use node_core::{ModelTensors, StoreConfig};
//! use update_store::{CheckpointKind, LocalStorage, UpdateStore};
//!
//! # async fn example() -> node_core::Result<()> {
//! let store = UpdateStore::new(
//!     Arc::new(LocalStorage::new("/tmp/updatestore")),
//!     &StoreConfig::default(),
//! );
//! let aggregate = ModelTensors::from_json(&serde_json::json!([[0.1, 0.2]]))?;
//! store
//!     .checkpoint("repo", "session", 1, CheckpointKind::RoundCompleted, &aggregate)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod memory;
pub mod model_host;
pub mod store;
pub mod writer;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use model_host::{HostedModel, ModelHost, StoredModelHost};
pub use store::{CheckpointKind, CheckpointRecord, EventKind, EventRecord, UpdateStore, WriteStats};
pub use writer::{UpdateWriter, WriteRequest, WriterCommand, WriterConfig, WriterEvent};
