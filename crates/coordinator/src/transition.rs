//! Results of a state transition
//!
//! Transitions are computed under a repo's session lock. Their effects are
//! collaborator calls (publishing, persistence) that run after the lock is
//! released; the dispatch is delivered once the effects have run.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use node_core::{Error, ModelFormat, ModelTensors, RepoId, Round, SessionId};
use update_store::{CheckpointKind, EventKind};

use crate::message::{Dispatch, Outbound};

/// Weights a published model is built from
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// The model the dashboard uploaded for the session
    Initial,

    /// An aggregate computed by the node
    Aggregate(Arc<ModelTensors>),
}

/// Opens once a round's hosted model has been published, whether or not
/// publishing succeeded
#[derive(Debug, Clone)]
pub struct ModelGate(Arc<watch::Sender<bool>>);

impl ModelGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn open(&self) {
        self.0.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the gate is open
    pub async fn opened(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for ModelGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ModelGate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Collaborator call requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Host the model of `round`, then open `ready`
    PublishModel {
        repo_id: RepoId,
        session_id: SessionId,
        round: Round,
        format: ModelFormat,
        source: ModelSource,
        ready: ModelGate,
    },

    /// Hold the dispatch until the referenced model is hosted
    AwaitModel { ready: ModelGate },

    Checkpoint {
        repo_id: RepoId,
        session_id: SessionId,
        round: Round,
        kind: CheckpointKind,
        payload: Arc<ModelTensors>,
    },
    LogEvent {
        kind: EventKind,
        repo_id: RepoId,
        session_id: SessionId,
        payload: Value,
    },
}

/// Dispatch plus the effects that must run before it is delivered
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub dispatch: Dispatch,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            effects: Vec::new(),
        }
    }

    pub fn none() -> Self {
        Self::new(Dispatch::None)
    }

    pub fn reply(message: Outbound) -> Self {
        Self::new(Dispatch::unicast(message))
    }

    pub fn error(e: &Error) -> Self {
        Self::new(Dispatch::error(e))
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Run `effects` ahead of this transition's own
    pub fn preceded_by(mut self, mut effects: Vec<Effect>) -> Self {
        effects.append(&mut self.effects);
        self.effects = effects;
        self
    }

    pub fn is_none(&self) -> bool {
        self.dispatch.is_none() && self.effects.is_empty()
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = (&Round, &CheckpointKind)> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Checkpoint { round, kind, .. } => Some((round, kind)),
            _ => None,
        })
    }
}
