//! Wire messages
//!
//! Inbound messages are JSON objects discriminated by their `type` field.
//! Outbound traffic is a [`Dispatch`]: who to send to, and what.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use node_core::{
    ConnectionId, ContinuationCriteria, DatasetId, Error, ErrorKind, LibraryType, ModelFormat,
    ModelTensors, NodeType, RawCriteria, RepoId, Result, Round, SelectionCriteria, SessionConfig,
    SessionId, TerminationCriteria, Transmission,
};

/// Inbound message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    NewSession,
    NewUpdate,
    NoDataset,
    TrainingError,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(MessageType::Register),
            "NEW_SESSION" => Some(MessageType::NewSession),
            "NEW_UPDATE" => Some(MessageType::NewUpdate),
            "NO_DATASET" => Some(MessageType::NoDataset),
            "TRAINING_ERROR" => Some(MessageType::TrainingError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "REGISTER",
            MessageType::NewSession => "NEW_SESSION",
            MessageType::NewUpdate => "NEW_UPDATE",
            MessageType::NoDataset => "NO_DATASET",
            MessageType::TrainingError => "TRAINING_ERROR",
        }
    }
}

/// `REGISTER`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterMessage {
    pub node_type: NodeType,
    pub repo_id: RepoId,
    pub api_key: String,
    #[serde(default)]
    pub is_demo: bool,
}

fn default_checkpoint_frequency() -> u64 {
    1
}

/// `NEW_SESSION`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewSessionMessage {
    pub repo_id: RepoId,
    pub session_id: SessionId,
    #[serde(default)]
    pub hyperparams: Value,
    pub selection_criteria: RawCriteria,
    pub continuation_criteria: RawCriteria,
    pub termination_criteria: RawCriteria,
    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: u64,
    pub library_type: String,
    #[serde(default)]
    pub ios_config: Option<Value>,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
}

impl NewSessionMessage {
    /// Validate the request into an immutable session configuration
    pub fn into_config(self) -> Result<SessionConfig> {
        let library_type: LibraryType = self.library_type.parse()?;
        if library_type.requires_ios_config() && self.ios_config.is_none() {
            return Err(Error::InvalidConfig {
                message: format!("{library_type} sessions require ios_config"),
            });
        }

        Ok(SessionConfig {
            selection: SelectionCriteria::try_from(&self.selection_criteria)?,
            continuation: ContinuationCriteria::try_from(&self.continuation_criteria)?,
            termination: TerminationCriteria::try_from(&self.termination_criteria)?,
            repo_id: self.repo_id,
            session_id: self.session_id,
            dataset_id: self.dataset_id,
            hyperparams: self.hyperparams,
            checkpoint_frequency: self.checkpoint_frequency,
            library_type,
            ios_config: self.ios_config,
        })
    }
}

/// Body of a `NEW_UPDATE`: exactly one of weights or gradients
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateResults {
    #[serde(default)]
    pub weights: Option<ModelTensors>,
    #[serde(default)]
    pub gradients: Option<ModelTensors>,
    pub omega: f64,
}

/// `NEW_UPDATE`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewUpdateMessage {
    pub repo_id: RepoId,
    pub session_id: SessionId,
    pub round: Round,
    pub results: UpdateResults,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
}

/// A decoded contribution
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub repo_id: RepoId,
    pub session_id: SessionId,
    pub round: Round,
    pub kind: Transmission,
    pub values: ModelTensors,
    pub omega: f64,
    pub dataset_id: Option<DatasetId>,
}

impl NewUpdateMessage {
    pub fn into_update(self) -> Result<Update> {
        let (kind, values) = match (self.results.weights, self.results.gradients) {
            (Some(weights), None) => (Transmission::Weights, weights),
            (None, Some(gradients)) => (Transmission::Gradients, gradients),
            (Some(_), Some(_)) => {
                return Err(Error::Deserialization {
                    message: "results carry both weights and gradients".to_string(),
                })
            }
            (None, None) => {
                return Err(Error::Deserialization {
                    message: "results carry neither weights nor gradients".to_string(),
                })
            }
        };

        Ok(Update {
            repo_id: self.repo_id,
            session_id: self.session_id,
            round: self.round,
            kind,
            values,
            omega: self.results.omega,
            dataset_id: self.dataset_id,
        })
    }
}

/// `NO_DATASET` and `TRAINING_ERROR`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoundReport {
    pub repo_id: RepoId,
    pub session_id: SessionId,
    pub round: Round,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Register(RegisterMessage),
    NewSession(NewSessionMessage),
    NewUpdate(NewUpdateMessage),
    NoDataset(RoundReport),
    TrainingError(RoundReport),
}

impl Inbound {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadMessageType {
                message_type: "<missing>".to_string(),
            })?;
        let message_type = MessageType::parse(tag).ok_or_else(|| Error::BadMessageType {
            message_type: tag.to_string(),
        })?;

        Ok(match message_type {
            MessageType::Register => Inbound::Register(body(value)?),
            MessageType::NewSession => Inbound::NewSession(body(value)?),
            MessageType::NewUpdate => Inbound::NewUpdate(body(value)?),
            MessageType::NoDataset => Inbound::NoDataset(body(value)?),
            MessageType::TrainingError => Inbound::TrainingError(body(value)?),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Inbound::Register(_) => MessageType::Register,
            Inbound::NewSession(_) => MessageType::NewSession,
            Inbound::NewUpdate(_) => MessageType::NewUpdate,
            Inbound::NoDataset(_) => MessageType::NoDataset,
            Inbound::TrainingError(_) => MessageType::TrainingError,
        }
    }

    pub fn repo_id(&self) -> &str {
        match self {
            Inbound::Register(m) => &m.repo_id,
            Inbound::NewSession(m) => &m.repo_id,
            Inbound::NewUpdate(m) => &m.repo_id,
            Inbound::NoDataset(r) | Inbound::TrainingError(r) => &r.repo_id,
        }
    }
}

fn body<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Deserialization {
        message: e.to_string(),
    })
}

/// `action` values of outbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Train,
    Stop,
    RegistrationSuccess,
}

/// Where a weight-mode client downloads the round's model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelLocator {
    pub format: ModelFormat,
    pub uri: String,
}

/// `TRAIN`, sent to the cohort at the start of every round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainMessage {
    pub session_id: SessionId,
    pub repo_id: RepoId,
    pub round: Round,
    pub action: Action,
    pub hyperparams: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradients: Option<Arc<ModelTensors>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelLocator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<DatasetId>,
}

/// `STOP`, sent to every participant when a session ends
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopMessage {
    pub action: Action,
    pub session_id: SessionId,
    pub repo_id: RepoId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<DatasetId>,
}

/// Registration acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredMessage {
    pub action: Action,
    pub error: bool,
}

impl Default for RegisteredMessage {
    fn default() -> Self {
        Self {
            action: Action::RegistrationSuccess,
            error: false,
        }
    }
}

/// Error reported to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub error: bool,
    pub error_message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_message: message.into(),
            kind,
        }
    }
}

impl From<&Error> for ErrorEnvelope {
    fn from(e: &Error) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Any outbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Train(TrainMessage),
    Stop(StopMessage),
    Registered(RegisteredMessage),
    Error(ErrorEnvelope),
}

/// Delivery instruction handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum Dispatch {
    /// Nothing to send
    None,

    /// Reply to the sender only
    Unicast { message: Outbound },

    /// Send to every listed connection
    Broadcast {
        client_list: Vec<ConnectionId>,
        message: Outbound,
    },
}

impl Dispatch {
    pub fn unicast(message: Outbound) -> Self {
        Dispatch::Unicast { message }
    }

    pub fn broadcast(client_list: Vec<ConnectionId>, message: Outbound) -> Self {
        Dispatch::Broadcast {
            client_list,
            message,
        }
    }

    pub fn error(e: &Error) -> Self {
        Dispatch::unicast(Outbound::Error(e.into()))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Dispatch::None)
    }

    pub fn message(&self) -> Option<&Outbound> {
        match self {
            Dispatch::None => None,
            Dispatch::Unicast { message } | Dispatch::Broadcast { message, .. } => Some(message),
        }
    }

    /// Connections that should receive this dispatch
    pub fn recipients(&self, sender: ConnectionId) -> Vec<ConnectionId> {
        match self {
            Dispatch::None => Vec::new(),
            Dispatch::Unicast { .. } => vec![sender],
            Dispatch::Broadcast { client_list, .. } => client_list.clone(),
        }
    }
}
