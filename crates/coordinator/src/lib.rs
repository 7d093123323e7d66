//! Federated learning cloud node
//!
//! This crate provides the node that drives training sessions:
//! - **Sessions**: Per-repo lifecycle from NEW_SESSION to STOP
//! - **Aggregation**: Weighted running average and round advancement
//! - **Routing**: Authorization and dispatch of client messages
//! - **Transport**: WebSocket endpoint and HTTP status API
//! - **Security**: Input validation, message metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coordinator::{CloudNodeServer, CloudNodeService};
//! use node_core::CloudNodeConfig;
//! use update_store::LocalStorage;
//!
//! #[tokio::main]
//! async fn main() -> node_core::Result<()> {
//!     let config = CloudNodeConfig::default();
//!     let backend = Arc::new(LocalStorage::new(&config.store.base_path));
//!     let service = CloudNodeService::new(&config, backend)?;
//!     CloudNodeServer::new(service, config.server).run().await
//! }
//! ```

pub mod aggregator;
pub mod http_api;
pub mod message;
pub mod middleware;
pub mod router;
pub mod server;
pub mod service;
pub mod session;
pub mod transition;

// Re-export main types
pub use aggregator::{continuation_met, termination_met, Aggregator};
pub use message::{Dispatch, Inbound, MessageType, Outbound};
pub use router::MessageRouter;
pub use server::{CloudNodeServer, ConnectionTable};
pub use service::CloudNodeService;
pub use session::{Coordinator, SessionPhase, SessionSnapshot, SessionState, StopReason};
pub use transition::{Effect, ModelGate, Transition};
