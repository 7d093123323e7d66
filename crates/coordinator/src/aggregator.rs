//! Update aggregation and round advancement

use serde_json::json;
use tracing::{debug, info};

use node_core::{
    AggregationConfig, AggregatorError, ConnectionId, ContinuationCriteria, Result, Roster, Round,
    TerminationCriteria,
};
use update_store::{CheckpointKind, EventKind};

use crate::message::{RoundReport, Update};
use crate::session::{ActiveSession, Coordinator, SessionState, StopReason};
use crate::transition::{Effect, Transition};

/// Whether the current round is complete
pub fn continuation_met(
    criteria: &ContinuationCriteria,
    averaged: usize,
    chosen: usize,
    policy: &AggregationConfig,
) -> bool {
    match criteria {
        ContinuationCriteria::PercentageAveraged { value } => {
            if chosen == 0 {
                // Nobody was selected: the first report ends the round
                return policy.empty_cohort_continues;
            }
            let percentage = averaged as f64 / chosen as f64;
            if policy.inclusive_threshold {
                *value <= percentage
            } else {
                *value < percentage
            }
        }
    }
}

/// Whether the session is over once `round` has been reached
pub fn termination_met(criteria: &TerminationCriteria, round: Round) -> bool {
    match criteria {
        TerminationCriteria::MaxRound { value } => *value < round,
    }
}

/// Folds updates into the running average and decides when rounds advance
pub struct Aggregator {
    policy: AggregationConfig,
    checkpoint_on_termination: bool,
}

impl Aggregator {
    pub fn new(policy: AggregationConfig, checkpoint_on_termination: bool) -> Self {
        Self {
            policy,
            checkpoint_on_termination,
        }
    }

    /// Validate and fold a `NEW_UPDATE`. Rejections leave the session as it was.
    pub fn handle_update(
        &self,
        coordinator: &Coordinator,
        state: &mut SessionState,
        roster: &Roster,
        sender: ConnectionId,
        update: Update,
    ) -> Result<Transition> {
        let session = expect_round(state, &update.repo_id, &update.session_id, update.round, sender)?;

        let expected = session.config.transmission();
        if update.kind != expected {
            return Err(AggregatorError::TransmissionMismatch {
                expected,
                actual: update.kind,
            }
            .into());
        }
        if !update.omega.is_finite() || update.omega < 0.0 {
            return Err(AggregatorError::InvalidOmega { omega: update.omega }.into());
        }

        session.fold(update.values, update.omega)?;
        session.mark_reported(sender, true);

        debug!(
            repo_id = %update.repo_id,
            round = update.round,
            connection = %sender,
            omega = update.omega,
            num_nodes_averaged = session.num_nodes_averaged,
            num_nodes_chosen = session.num_nodes_chosen(),
            "Update folded"
        );

        Ok(self.advance(coordinator, state, roster))
    }

    /// A cohort member has no data: drop it from the round and re-check
    /// continuation without folding anything
    pub fn handle_no_dataset(
        &self,
        coordinator: &Coordinator,
        state: &mut SessionState,
        roster: &Roster,
        sender: ConnectionId,
        report: &RoundReport,
    ) -> Result<Transition> {
        let session = expect_round(state, &report.repo_id, &report.session_id, report.round, sender)?;

        session.cohort.retain(|c| *c != sender);
        session.mark_reported(sender, false);

        info!(
            repo_id = %report.repo_id,
            round = report.round,
            connection = %sender,
            num_nodes_chosen = session.num_nodes_chosen(),
            "Library has no dataset, removed from round"
        );

        Ok(self.advance(coordinator, state, roster))
    }

    /// Complete the round if continuation is met, then start the next one
    /// or terminate
    fn advance(&self, coordinator: &Coordinator, state: &mut SessionState, roster: &Roster) -> Transition {
        let Some(session) = state.active_mut() else {
            return Transition::none();
        };
        if !continuation_met(
            &session.config.continuation,
            session.num_nodes_averaged,
            session.num_nodes_chosen(),
            &self.policy,
        ) {
            return Transition::none();
        }

        let completed = session.current_round;
        let averaged = session.num_nodes_averaged;
        let result = session.seal_round();
        session.current_round += 1;
        let terminate = termination_met(&session.config.termination, session.current_round);

        let repo_id = session.config.repo_id.clone();
        let session_id = session.config.session_id.clone();

        info!(
            repo_id = %repo_id,
            session_id = %session_id,
            round = completed,
            num_nodes_averaged = averaged,
            terminate,
            "Round completed"
        );

        let mut effects = vec![Effect::LogEvent {
            kind: EventKind::RoundCompleted,
            repo_id: repo_id.clone(),
            session_id: session_id.clone(),
            payload: json!({
                "round": completed,
                "num_nodes_averaged": averaged,
                "num_nodes_chosen": session.num_nodes_chosen(),
            }),
        }];

        let final_checkpoint = terminate && self.checkpoint_on_termination;
        if let Some(payload) = result {
            if session.config.checkpoint_due(completed) || final_checkpoint {
                effects.push(Effect::Checkpoint {
                    repo_id,
                    session_id,
                    round: completed,
                    kind: if terminate {
                        CheckpointKind::SessionCompleted
                    } else {
                        CheckpointKind::RoundCompleted
                    },
                    payload,
                });
            }
        }

        let next = if terminate {
            coordinator.stop_session(state, roster, StopReason::Terminated)
        } else {
            coordinator.start_next_round(session, roster)
        };
        next.preceded_by(effects)
    }
}

/// The active session, provided the report targets its current round and
/// the sender still owes a report
fn expect_round<'a>(
    state: &'a mut SessionState,
    repo_id: &str,
    session_id: &str,
    round: Round,
    sender: ConnectionId,
) -> std::result::Result<&'a mut ActiveSession, AggregatorError> {
    let session = state.active_mut().ok_or_else(|| AggregatorError::NoActiveSession {
        repo_id: repo_id.to_string(),
    })?;

    if session.config.session_id != session_id {
        return Err(AggregatorError::SessionMismatch {
            expected: session.config.session_id.clone(),
            actual: session_id.to_string(),
        });
    }
    if session.current_round != round {
        return Err(AggregatorError::RoundMismatch {
            expected: session.current_round,
            actual: round,
        });
    }
    if session.has_reported(&sender) {
        return Err(AggregatorError::DuplicateUpdate {
            connection: sender,
            round,
        });
    }
    if !session.cohort.contains(&sender) {
        return Err(AggregatorError::NotInCohort { connection: sender });
    }
    Ok(session)
}
