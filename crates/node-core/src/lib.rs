//! Node Core - Foundation for the federated learning cloud node
//!
//! Provides the shared vocabulary used by the coordinator and the update
//! store: identifiers and roles, session configuration and criteria, the
//! error taxonomy, the per-repository client registry, and the layered
//! tensors that updates are averaged over.

pub mod config;
pub mod criteria;
pub mod error;
pub mod registry;
pub mod tensor;
pub mod types;

pub use config::{AggregationConfig, AuthConfig, CloudNodeConfig, ServerConfig, StoreConfig};
pub use criteria::{ContinuationCriteria, RawCriteria, SelectionCriteria, TerminationCriteria};
pub use error::{AggregatorError, Error, ErrorKind, RegistrationError, Result};
pub use registry::{ClientRegistry, ClientRegistryHandle, Membership, Roster};
pub use tensor::{weighted_mean, ModelTensors};
pub use types::*;
