//! Per-repository session state and its lifecycle
//!
//! A repo is IDLE (no [`ActiveSession`]) or IN_ROUND. Starting and
//! terminating happen entirely under the repo's lock, so they are never
//! observable as separate phases.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use node_core::{
    AggregatorError, ConnectionId, Error, ErrorKind, ModelFormat, ModelTensors, Result, Roster,
    Round, SelectionCriteria, SessionConfig, Transmission,
};
use update_store::{EventKind, ModelHost};

use crate::message::{
    Action, Dispatch, ErrorEnvelope, ModelLocator, Outbound, RoundReport, StopMessage,
    TrainMessage,
};
use crate::transition::{Effect, ModelGate, ModelSource, Transition};

/// Weighted running average of the current round
#[derive(Debug, Clone)]
struct Accumulator {
    values: ModelTensors,
    sigma_omega: f64,
}

/// A session in progress
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub config: SessionConfig,

    /// Starts at 1, advances by one per completed round
    pub current_round: Round,

    /// Connections expected to report this round
    pub cohort: Vec<ConnectionId>,

    /// Cohort members that already reported this round
    contributors: HashSet<ConnectionId>,

    pub num_nodes_averaged: usize,

    accumulator: Option<Accumulator>,

    /// Aggregate of the most recent round that folded anything
    last_result: Option<Arc<ModelTensors>>,

    /// Round whose hosted model weight-mode clients should load
    model_round: Round,

    /// Opens once the model of `model_round` is hosted
    model_ready: Option<ModelGate>,

    /// Re-sent to libraries that join mid-round
    pub last_message_sent_to_library: TrainMessage,

    pub last_message_time: Option<DateTime<Utc>>,

    pub started_at: DateTime<Utc>,
}

impl ActiveSession {
    pub fn num_nodes_chosen(&self) -> usize {
        self.cohort.len()
    }

    /// Current round's aggregate, if anything has been folded
    pub fn aggregate(&self) -> Option<&ModelTensors> {
        self.accumulator.as_ref().map(|a| &a.values)
    }

    pub fn sigma_omega(&self) -> f64 {
        self.accumulator.as_ref().map(|a| a.sigma_omega).unwrap_or(0.0)
    }

    pub fn last_result(&self) -> Option<&Arc<ModelTensors>> {
        self.last_result.as_ref()
    }

    pub fn has_reported(&self, connection: &ConnectionId) -> bool {
        self.contributors.contains(connection)
    }

    /// Fold one contribution into the running average.
    ///
    /// A zero-weight contribution is shape-checked but changes nothing.
    /// Nothing is mutated on error.
    pub fn fold(&mut self, values: ModelTensors, omega: f64) -> std::result::Result<(), AggregatorError> {
        let reference = self
            .accumulator
            .as_ref()
            .map(|a| &a.values)
            .or(self.last_result.as_deref());
        if let Some(reference) = reference {
            if !reference.is_compatible(&values) {
                return Err(AggregatorError::ShapeMismatch {
                    message: format!("expected {:?}, got {:?}", reference.shapes(), values.shapes()),
                });
            }
        }

        if omega == 0.0 {
            return Ok(());
        }

        match &mut self.accumulator {
            None => {
                self.accumulator = Some(Accumulator {
                    values,
                    sigma_omega: omega,
                });
            }
            Some(acc) => {
                acc.values.weighted_fold(acc.sigma_omega, &values, omega)?;
                acc.sigma_omega += omega;
            }
        }
        Ok(())
    }

    /// Record that `connection` reported for this round
    pub fn mark_reported(&mut self, connection: ConnectionId, averaged: bool) {
        self.contributors.insert(connection);
        if averaged {
            self.num_nodes_averaged += 1;
        }
        self.last_message_time = Some(Utc::now());
    }

    /// Close the round's accumulator. Returns the newest result, which is the
    /// previous one when nothing was folded this round.
    pub fn seal_round(&mut self) -> Option<Arc<ModelTensors>> {
        if let Some(acc) = self.accumulator.take() {
            self.last_result = Some(Arc::new(acc.values));
        }
        self.last_result.clone()
    }

    fn model_locator(&self, model_host: &dyn ModelHost) -> Option<ModelLocator> {
        let format = self.config.library_type.model_format()?;
        Some(ModelLocator {
            format,
            uri: model_host.locate(
                &self.config.repo_id,
                &self.config.session_id,
                self.model_round,
                format,
            ),
        })
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// Termination criteria met
    Terminated,

    /// The repo's DASHBOARD is gone
    OwnerDisconnected,

    /// A library reported an unrecoverable failure
    TrainingError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Terminated => "terminated",
            StopReason::OwnerDisconnected => "owner disconnected",
            StopReason::TrainingError => "training error",
        };
        f.write_str(s)
    }
}

/// Lifecycle phase as reported over HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Idle,
    InRound,
}

/// Read-only view of a repo's session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub repo_id: String,
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_round: Option<Round>,
    pub num_nodes_averaged: usize,
    pub num_nodes_chosen: usize,
    pub sigma_omega: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Authoritative session record of one repo
#[derive(Debug, Default)]
pub struct SessionState {
    active: Option<ActiveSession>,
}

impl SessionState {
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveSession> {
        self.active.as_mut()
    }

    /// Drop the active session, returning it
    pub fn reset(&mut self) -> Option<ActiveSession> {
        self.active.take()
    }

    pub fn snapshot(&self, repo_id: &str) -> SessionSnapshot {
        match &self.active {
            None => SessionSnapshot {
                repo_id: repo_id.to_string(),
                phase: SessionPhase::Idle,
                session_id: None,
                library_type: None,
                current_round: None,
                num_nodes_averaged: 0,
                num_nodes_chosen: 0,
                sigma_omega: 0.0,
                last_message_time: None,
                started_at: None,
            },
            Some(session) => SessionSnapshot {
                repo_id: repo_id.to_string(),
                phase: SessionPhase::InRound,
                session_id: Some(session.config.session_id.clone()),
                library_type: Some(session.config.library_type.to_string()),
                current_round: Some(session.current_round),
                num_nodes_averaged: session.num_nodes_averaged,
                num_nodes_chosen: session.num_nodes_chosen(),
                sigma_omega: session.sigma_omega(),
                last_message_time: session.last_message_time,
                started_at: Some(session.started_at),
            },
        }
    }
}

/// Session lifecycle transitions
pub struct Coordinator {
    model_host: Arc<dyn ModelHost>,
}

impl Coordinator {
    pub fn new(model_host: Arc<dyn ModelHost>) -> Self {
        Self { model_host }
    }

    fn select(selection: SelectionCriteria, roster: &Roster) -> Vec<ConnectionId> {
        match selection {
            SelectionCriteria::AllNodes => roster.libraries.clone(),
        }
    }

    /// IDLE -> IN_ROUND (round 1)
    pub fn start_new_session(
        &self,
        state: &mut SessionState,
        config: SessionConfig,
        roster: &Roster,
    ) -> Result<Transition> {
        if let Some(active) = &state.active {
            return Err(Error::ServerBusy {
                repo_id: active.config.repo_id.clone(),
            });
        }

        let cohort = Self::select(config.selection, roster);
        let now = Utc::now();

        let mut session = ActiveSession {
            current_round: 1,
            cohort: cohort.clone(),
            contributors: HashSet::new(),
            num_nodes_averaged: 0,
            accumulator: None,
            last_result: None,
            model_round: 1,
            model_ready: None,
            last_message_sent_to_library: TrainMessage {
                session_id: config.session_id.clone(),
                repo_id: config.repo_id.clone(),
                round: 1,
                action: Action::Train,
                hyperparams: config.hyperparams.clone(),
                gradients: None,
                model: None,
                dataset_id: config.dataset_id.clone(),
            },
            last_message_time: None,
            started_at: now,
            config,
        };
        session.last_message_sent_to_library.model = session.model_locator(self.model_host.as_ref());

        let config = &session.config;
        let mut effects = vec![Effect::LogEvent {
            kind: EventKind::SessionStarted,
            repo_id: config.repo_id.clone(),
            session_id: config.session_id.clone(),
            payload: json!({
                "library_type": config.library_type,
                "num_nodes_chosen": cohort.len(),
                "hyperparams": config.hyperparams,
            }),
        }];
        if let Some(format) = config.library_type.model_format() {
            let ready = ModelGate::new();
            effects.insert(0, publish(config, 1, format, ModelSource::Initial, ready.clone()));
            session.model_ready = Some(ready);
        }

        info!(
            repo_id = %config.repo_id,
            session_id = %config.session_id,
            library_type = %config.library_type,
            num_nodes_chosen = cohort.len(),
            "Session started"
        );

        let message = Outbound::Train(session.last_message_sent_to_library.clone());
        state.active = Some(session);

        Ok(Transition::new(Dispatch::broadcast(cohort, message)).preceded_by(effects))
    }

    /// Begin `session.current_round`, which the caller has already advanced.
    /// The previous round's accumulator must already be sealed.
    pub fn start_next_round(&self, session: &mut ActiveSession, roster: &Roster) -> Transition {
        session.num_nodes_averaged = 0;
        session.contributors.clear();
        session.cohort = Self::select(session.config.selection, roster);

        let mut effects = Vec::new();
        let mut message = TrainMessage {
            session_id: session.config.session_id.clone(),
            repo_id: session.config.repo_id.clone(),
            round: session.current_round,
            action: Action::Train,
            hyperparams: session.config.hyperparams.clone(),
            gradients: None,
            model: None,
            dataset_id: session.config.dataset_id.clone(),
        };

        match session.config.transmission() {
            Transmission::Gradients => message.gradients = session.last_result.clone(),
            Transmission::Weights => {
                if let (Some(format), Some(result)) =
                    (session.config.library_type.model_format(), &session.last_result)
                {
                    let ready = ModelGate::new();
                    session.model_round = session.current_round;
                    effects.push(publish(
                        &session.config,
                        session.current_round,
                        format,
                        ModelSource::Aggregate(result.clone()),
                        ready.clone(),
                    ));
                    session.model_ready = Some(ready);
                }
                message.model = session.model_locator(self.model_host.as_ref());
            }
        }

        info!(
            repo_id = %session.config.repo_id,
            session_id = %session.config.session_id,
            round = session.current_round,
            num_nodes_chosen = session.cohort.len(),
            "Round started"
        );

        session.last_message_sent_to_library = message.clone();
        Transition::new(Dispatch::broadcast(session.cohort.clone(), Outbound::Train(message)))
            .preceded_by(effects)
    }

    /// Any state -> IDLE, broadcasting STOP to every participant.
    /// Stopping an idle repo does nothing.
    pub fn stop_session(&self, state: &mut SessionState, roster: &Roster, reason: StopReason) -> Transition {
        let Some(session) = state.reset() else {
            return Transition::none();
        };
        let config = &session.config;

        info!(
            repo_id = %config.repo_id,
            session_id = %config.session_id,
            round = session.current_round,
            reason = %reason,
            "Session stopped"
        );

        let message = Outbound::Stop(StopMessage {
            action: Action::Stop,
            session_id: config.session_id.clone(),
            repo_id: config.repo_id.clone(),
            dataset_id: config.dataset_id.clone(),
        });
        Transition::new(Dispatch::broadcast(roster.participants(), message)).with_effect(
            Effect::LogEvent {
                kind: EventKind::SessionStopped,
                repo_id: config.repo_id.clone(),
                session_id: config.session_id.clone(),
                payload: json!({"reason": reason, "round": session.current_round}),
            },
        )
    }

    /// A library registered while a session is live: enrol it in the current
    /// round and hand it the cached TRAIN message
    pub fn admit_library(&self, state: &mut SessionState, connection: ConnectionId) -> Option<Transition> {
        let session = state.active_mut()?;
        if !session.cohort.contains(&connection) {
            session.cohort.push(connection);
        }

        info!(
            repo_id = %session.config.repo_id,
            connection = %connection,
            round = session.current_round,
            num_nodes_chosen = session.cohort.len(),
            "Library joined running session"
        );
        let reply = Transition::reply(Outbound::Train(
            session.last_message_sent_to_library.clone(),
        ));
        // The cached TRAIN may point at a model still being published
        Some(match &session.model_ready {
            Some(ready) if !ready.is_open() => reply.with_effect(Effect::AwaitModel {
                ready: ready.clone(),
            }),
            _ => reply,
        })
    }

    /// Abort the session and tell every participant training failed
    pub fn training_error(
        &self,
        state: &mut SessionState,
        roster: &Roster,
        report: &RoundReport,
    ) -> Result<Transition> {
        let session = state.active().ok_or_else(|| AggregatorError::NoActiveSession {
            repo_id: report.repo_id.clone(),
        })?;
        if session.config.session_id != report.session_id {
            return Err(AggregatorError::SessionMismatch {
                expected: session.config.session_id.clone(),
                actual: report.session_id.clone(),
            }
            .into());
        }

        let failure = Error::TrainingFailed {
            repo_id: report.repo_id.clone(),
            session_id: report.session_id.clone(),
        };
        warn!(
            repo_id = %report.repo_id,
            session_id = %report.session_id,
            round = report.round,
            "Library reported a training error"
        );
        state.reset();

        Ok(Transition::new(Dispatch::broadcast(
            roster.participants(),
            Outbound::Error(ErrorEnvelope::new(ErrorKind::ModelError, failure.to_string())),
        ))
        .with_effect(Effect::LogEvent {
            kind: EventKind::TrainingError,
            repo_id: report.repo_id.clone(),
            session_id: report.session_id.clone(),
            payload: json!({"round": report.round, "dataset_id": report.dataset_id}),
        }))
    }
}

fn publish(
    config: &SessionConfig,
    round: Round,
    format: ModelFormat,
    source: ModelSource,
    ready: ModelGate,
) -> Effect {
    Effect::PublishModel {
        repo_id: config.repo_id.clone(),
        session_id: config.session_id.clone(),
        round,
        format,
        source,
        ready,
    }
}
