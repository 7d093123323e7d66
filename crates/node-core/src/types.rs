//! Core type definitions for the cloud node

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::criteria::{ContinuationCriteria, SelectionCriteria, TerminationCriteria};
use crate::Error;

/// Unique identifier types
pub type RepoId = String;
pub type SessionId = String;
pub type DatasetId = String;

/// Training round counter (starts at 1)
pub type Round = u64;

/// Opaque handle for a connected peer, assigned by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role a connection declares when it registers.
///
/// Accepted case-insensitively on the wire (`"library"` and `"LIBRARY"`
/// are the same role) and always sent back upper case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum NodeType {
    /// Training client
    Library,

    /// Orchestrating dashboard, owner of the repo's session
    Dashboard,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Library => "LIBRARY",
            NodeType::Dashboard => "DASHBOARD",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for NodeType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "LIBRARY" => Ok(NodeType::Library),
            "DASHBOARD" => Ok(NodeType::Dashboard),
            _ => Err(format!("Incorrect node type ({value})")),
        }
    }
}

/// Client runtime a session trains on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LibraryType {
    Python,
    Javascript,
    IosImage,
    IosText,
}

impl LibraryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryType::Python => "PYTHON",
            LibraryType::Javascript => "JAVASCRIPT",
            LibraryType::IosImage => "IOS_IMAGE",
            LibraryType::IosText => "IOS_TEXT",
        }
    }

    /// How round results travel back to the clients
    pub fn transmission(&self) -> Transmission {
        match self {
            LibraryType::Python => Transmission::Gradients,
            _ => Transmission::Weights,
        }
    }

    /// Model format clients of this runtime load, if they load a hosted model
    pub fn model_format(&self) -> Option<ModelFormat> {
        match self {
            LibraryType::Python => None,
            LibraryType::Javascript => Some(ModelFormat::Tfjs),
            LibraryType::IosImage | LibraryType::IosText => Some(ModelFormat::CoreMl),
        }
    }

    /// iOS runtimes need an `ios_config` block in the session request
    pub fn requires_ios_config(&self) -> bool {
        matches!(self, LibraryType::IosImage | LibraryType::IosText)
    }
}

impl FromStr for LibraryType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PYTHON" => Ok(LibraryType::Python),
            "JAVASCRIPT" => Ok(LibraryType::Javascript),
            "IOS_IMAGE" => Ok(LibraryType::IosImage),
            "IOS_TEXT" => Ok(LibraryType::IosText),
            other => Err(Error::InvalidLibraryType {
                library_type: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session's updates and TRAIN messages carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transmission {
    /// Per-layer gradients, sent inline in TRAIN messages
    Gradients,

    /// Full model weights, published through the model host
    Weights,
}

impl fmt::Display for Transmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transmission::Gradients => f.write_str("gradients"),
            Transmission::Weights => f.write_str("weights"),
        }
    }
}

/// Hosted model formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Tfjs,
    #[serde(rename = "coreml")]
    CoreMl,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Tfjs => "tfjs",
            ModelFormat::CoreMl => "coreml",
        }
    }

    /// File extension of the hosted artifact
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Tfjs => "json",
            ModelFormat::CoreMl => "mlmodel.json",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable configuration of a running session, built from a validated
/// `NEW_SESSION` request
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Repository the session belongs to
    pub repo_id: RepoId,

    /// Session identifier chosen by the dashboard
    pub session_id: SessionId,

    /// Dataset the clients should train on
    pub dataset_id: Option<DatasetId>,

    /// Opaque hyperparameters forwarded to clients
    pub hyperparams: serde_json::Value,

    /// Cohort selection policy
    pub selection: SelectionCriteria,

    /// When a round is complete
    pub continuation: ContinuationCriteria,

    /// When the session is complete
    pub termination: TerminationCriteria,

    /// Persist the aggregate every N completed rounds (0 disables)
    pub checkpoint_frequency: u64,

    /// Client runtime
    pub library_type: LibraryType,

    /// Extra configuration for iOS runtimes
    pub ios_config: Option<serde_json::Value>,
}

impl SessionConfig {
    pub fn transmission(&self) -> Transmission {
        self.library_type.transmission()
    }

    /// Whether a checkpoint is due after `completed_round`
    pub fn checkpoint_due(&self, completed_round: Round) -> bool {
        self.checkpoint_frequency > 0 && completed_round % self.checkpoint_frequency == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_case_insensitive() {
        let library: NodeType = serde_json::from_str("\"library\"").unwrap();
        assert_eq!(library, NodeType::Library);

        let dashboard: NodeType = serde_json::from_str("\"Dashboard\"").unwrap();
        assert_eq!(dashboard, NodeType::Dashboard);

        assert!(serde_json::from_str::<NodeType>("\"EXPLORA\"").is_err());
        assert_eq!(serde_json::to_string(&NodeType::Library).unwrap(), "\"LIBRARY\"");
    }

    #[test]
    fn test_library_type_parsing() {
        assert_eq!("PYTHON".parse::<LibraryType>().unwrap(), LibraryType::Python);
        assert_eq!("IOS_TEXT".parse::<LibraryType>().unwrap(), LibraryType::IosText);

        let err = "IOS".parse::<LibraryType>().unwrap_err();
        assert!(matches!(err, Error::InvalidLibraryType { .. }));
    }

    #[test]
    fn test_library_transmission() {
        assert_eq!(LibraryType::Python.transmission(), Transmission::Gradients);
        assert_eq!(LibraryType::Javascript.transmission(), Transmission::Weights);
        assert_eq!(LibraryType::Javascript.model_format(), Some(ModelFormat::Tfjs));
        assert_eq!(LibraryType::IosImage.model_format(), Some(ModelFormat::CoreMl));
        assert!(LibraryType::Python.model_format().is_none());
    }
}
