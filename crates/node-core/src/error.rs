//! Error types for the cloud node

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ConnectionId, Round, Transmission};

/// Result type alias using the cloud node Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error tag sent to clients in the `type` field of an error envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Authentication,
    Registration,
    NotRegistered,
    BadMessageType,
    Deserialization,
    ModelError,
    ServerBusy,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AUTHENTICATION",
            ErrorKind::Registration => "REGISTRATION",
            ErrorKind::NotRegistered => "NOT_REGISTERED",
            ErrorKind::BadMessageType => "BAD_MESSAGE_TYPE",
            ErrorKind::Deserialization => "DESERIALIZATION",
            ErrorKind::ModelError => "MODEL_ERROR",
            ErrorKind::ServerBusy => "SERVER_BUSY",
            ErrorKind::Configuration => "CONFIGURATION",
        }
    }
}

/// Registration failures reported by the client registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Client already exists in repo {repo_id}!")]
    AlreadyRegistered { repo_id: String },

    #[error("Only one DASHBOARD client allowed at a time for repo {repo_id}!")]
    DashboardSlotFull { repo_id: String },

    #[error("An internal demo device error occurred.")]
    DemoDeviceUnavailable,
}

/// Rejections of an update or dataset report; none of them mutate the session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregatorError {
    #[error("No session is running for repo {repo_id}")]
    NoActiveSession { repo_id: String },

    #[error("The session id in the message ({actual}) doesn't match the service's ({expected})")]
    SessionMismatch { expected: String, actual: String },

    #[error("The round in the message ({actual}) doesn't match the current round ({expected})")]
    RoundMismatch { expected: Round, actual: Round },

    #[error("Client {connection} is not part of the current round's cohort")]
    NotInCohort { connection: ConnectionId },

    #[error("Client {connection} already reported for round {round}")]
    DuplicateUpdate { connection: ConnectionId, round: Round },

    #[error("Update carries {actual} but the session trains with {expected}")]
    TransmissionMismatch {
        expected: Transmission,
        actual: Transmission,
    },

    #[error("Update shape doesn't match the current aggregate: {message}")]
    ShapeMismatch { message: String },

    #[error("Contribution weight must be a finite non-negative number, got {omega}")]
    InvalidOmega { omega: f64 },
}

/// Core error type for the cloud node
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("Unknown message type: {message_type}")]
    BadMessageType { message_type: String },

    #[error("Error deserializing message: {message}")]
    Deserialization { message: String },

    // Authorization errors
    #[error("API key provided is invalid!")]
    InvalidApiKey,

    #[error("This client is not registered as {node_type} for repo {repo_id}!")]
    NotRegistered { repo_id: String, node_type: String },

    // Registration errors
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    // Session lifecycle errors
    #[error("Server is already busy working on repo {repo_id}.")]
    ServerBusy { repo_id: String },

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    // Configuration errors
    #[error("Invalid library type: {library_type}")]
    InvalidLibraryType { library_type: String },

    #[error("Invalid {criteria} criteria: {message}")]
    InvalidCriteria {
        criteria: &'static str,
        message: String,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Training errors
    #[error("Error occurred during training! Check the model to ensure that it is valid!")]
    TrainingFailed { repo_id: String, session_id: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    #[error("Storage key {key} escapes the store root")]
    InvalidStorageKey { key: String },

    #[error("Persistence write failed: {message}")]
    WriteFailed { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Wire tag used when this error is reported to a client
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadMessageType { .. } => ErrorKind::BadMessageType,
            Error::Deserialization { .. } | Error::Serialization(_) => ErrorKind::Deserialization,
            Error::InvalidApiKey => ErrorKind::Authentication,
            Error::NotRegistered { .. } => ErrorKind::NotRegistered,
            Error::Registration(_) => ErrorKind::Registration,
            Error::Aggregator(AggregatorError::TransmissionMismatch { .. })
            | Error::Aggregator(AggregatorError::InvalidOmega { .. }) => ErrorKind::Deserialization,
            Error::Aggregator(AggregatorError::ShapeMismatch { .. }) => ErrorKind::ModelError,
            // Session lifecycle rejections share the busy tag
            Error::ServerBusy { .. } | Error::Aggregator(_) => ErrorKind::ServerBusy,
            Error::InvalidLibraryType { .. }
            | Error::InvalidCriteria { .. }
            | Error::InvalidConfig { .. } => ErrorKind::Configuration,
            // Server-side failures while handling a model
            Error::TrainingFailed { .. }
            | Error::Storage { .. }
            | Error::StoragePathNotFound { .. }
            | Error::InvalidStorageKey { .. }
            | Error::WriteFailed { .. }
            | Error::Io(_)
            | Error::ChannelClosed { .. }
            | Error::Timeout { .. }
            | Error::Internal { .. } => ErrorKind::ModelError,
        }
    }

    /// Returns true if this error is fatal to the request or session rather
    /// than a recoverable validation failure
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidLibraryType { .. }
                | Error::InvalidCriteria { .. }
                | Error::InvalidConfig { .. }
                | Error::TrainingFailed { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns true if retrying the same persistence operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Io(_) | Error::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
