//! Inbound message routing
//!
//! Every repo owns one [`SessionState`] behind its own mutex. The router
//! authorizes the sender, takes the repo's lock and hands the message to
//! the coordinator or aggregator. Nothing here awaits: effects are returned
//! in the [`Transition`] and run by the caller after the lock is gone.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use node_core::{
    AuthConfig, ClientRegistryHandle, ConnectionId, Error, NodeType, RegistrationError, RepoId,
    Result, Roster,
};

use crate::aggregator::Aggregator;
use crate::message::{
    Inbound, NewSessionMessage, NewUpdateMessage, Outbound, RegisterMessage, RegisteredMessage,
    RoundReport,
};
use crate::middleware::InputValidator;
use crate::session::{Coordinator, SessionSnapshot, SessionState, StopReason};
use crate::transition::Transition;

/// Repo whose first LIBRARY serves as the demo device
pub const DEMO_REPO: &str = "demo";

/// Routes decoded messages to the session of their repo
pub struct MessageRouter {
    registry: ClientRegistryHandle,
    sessions: DashMap<RepoId, Arc<Mutex<SessionState>>>,
    coordinator: Coordinator,
    aggregator: Aggregator,
    auth: AuthConfig,
    validator: InputValidator,
}

impl MessageRouter {
    pub fn new(
        registry: ClientRegistryHandle,
        coordinator: Coordinator,
        aggregator: Aggregator,
        auth: AuthConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            sessions: DashMap::new(),
            coordinator,
            aggregator,
            auth,
            validator: InputValidator::new()?,
        })
    }

    pub fn registry(&self) -> &ClientRegistryHandle {
        &self.registry
    }

    /// The lock guarding `repo_id`'s session, created on first use
    fn session_for(&self, repo_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(existing) = self.sessions.get(repo_id) {
            return existing.clone();
        }
        self.sessions
            .entry(repo_id.to_string())
            .or_default()
            .clone()
    }

    /// Session view of a repo the node knows about
    pub fn snapshot(&self, repo_id: &str) -> Option<SessionSnapshot> {
        match self.sessions.get(repo_id).map(|s| s.clone()) {
            Some(session) => Some(session.lock().snapshot(repo_id)),
            None if !self.registry.roster(repo_id).is_empty() => {
                Some(SessionState::default().snapshot(repo_id))
            }
            None => None,
        }
    }

    /// Number of repos with an active session
    pub fn active_sessions(&self) -> usize {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.iter().filter(|s| s.lock().is_busy()).count()
    }

    /// Handle one message from `sender`
    pub fn route(&self, sender: ConnectionId, inbound: Inbound) -> Result<Transition> {
        self.validator.validate(&inbound)?;

        debug!(
            connection = %sender,
            message_type = inbound.message_type().as_str(),
            repo_id = %inbound.repo_id(),
            "Routing message"
        );

        match inbound {
            Inbound::Register(message) => self.register(sender, message),
            Inbound::NewSession(message) => self.new_session(sender, message),
            Inbound::NewUpdate(message) => self.new_update(sender, message),
            Inbound::NoDataset(report) => self.no_dataset(sender, report),
            Inbound::TrainingError(report) => self.training_error(sender, report),
        }
    }

    /// A connection closed: drop it from the registry and stop the sessions
    /// it owned
    pub fn disconnect(&self, connection: ConnectionId) -> Vec<Transition> {
        let memberships = self.registry.remove_everywhere(&connection);
        if !memberships.is_empty() {
            info!(
                connection = %connection,
                repos = memberships.len(),
                "Client disconnected"
            );
        }

        memberships
            .into_iter()
            .filter(|m| m.node_type == NodeType::Dashboard)
            .filter_map(|m| {
                let session = self.sessions.get(&m.repo_id).map(|s| s.clone())?;
                let mut state = session.lock();
                let roster = self.registry.roster(&m.repo_id);
                let transition =
                    self.coordinator
                        .stop_session(&mut state, &roster, StopReason::OwnerDisconnected);
                (!transition.is_none()).then_some(transition)
            })
            .collect()
    }

    fn register(&self, sender: ConnectionId, message: RegisterMessage) -> Result<Transition> {
        if !self.auth.accepts(&message.api_key) {
            warn!(connection = %sender, repo_id = %message.repo_id, "Invalid API key");
            return Err(Error::InvalidApiKey);
        }

        let session = self.session_for(&message.repo_id);
        let mut state = session.lock();

        self.registry
            .register(sender, message.node_type, &message.repo_id)?;

        if message.node_type == NodeType::Dashboard && message.is_demo {
            self.enrol_demo_device(&message.repo_id)?;
        }

        if message.node_type == NodeType::Library {
            if let Some(transition) = self.coordinator.admit_library(&mut state, sender) {
                return Ok(transition);
            }
        }

        Ok(Transition::reply(Outbound::Registered(
            RegisteredMessage::default(),
        )))
    }

    /// Register the first library of the demo repo as a library of `repo_id`
    fn enrol_demo_device(&self, repo_id: &str) -> Result<()> {
        let device = self
            .registry
            .roster(DEMO_REPO)
            .libraries
            .first()
            .copied()
            .ok_or(RegistrationError::DemoDeviceUnavailable)?;

        if !self.registry.is_registered(&device, NodeType::Library, repo_id) {
            self.registry.register(device, NodeType::Library, repo_id)?;
            info!(connection = %device, repo_id = %repo_id, "Demo device enrolled");
        }
        Ok(())
    }

    fn new_session(&self, sender: ConnectionId, message: NewSessionMessage) -> Result<Transition> {
        self.require(sender, NodeType::Dashboard, &message.repo_id)?;

        let session = self.session_for(&message.repo_id);
        let mut state = session.lock();
        if state.is_busy() {
            warn!(repo_id = %message.repo_id, "New session rejected, repo busy");
            return Err(Error::ServerBusy {
                repo_id: message.repo_id,
            });
        }
        let config = message.into_config()?;
        let roster = self.registry.roster(&config.repo_id);
        self.coordinator.start_new_session(&mut state, config, &roster)
    }

    fn new_update(&self, sender: ConnectionId, message: NewUpdateMessage) -> Result<Transition> {
        self.require(sender, NodeType::Library, &message.repo_id)?;
        let update = message.into_update()?;

        let session = self.session_for(&update.repo_id);
        let mut state = session.lock();
        let roster = self.registry.roster(&update.repo_id);
        if let Some(stop) = self.stop_if_owner_gone(&mut state, &roster, &update.repo_id) {
            return Ok(stop);
        }
        self.aggregator
            .handle_update(&self.coordinator, &mut state, &roster, sender, update)
    }

    fn no_dataset(&self, sender: ConnectionId, report: RoundReport) -> Result<Transition> {
        self.require(sender, NodeType::Library, &report.repo_id)?;

        let session = self.session_for(&report.repo_id);
        let mut state = session.lock();
        let roster = self.registry.roster(&report.repo_id);
        if let Some(stop) = self.stop_if_owner_gone(&mut state, &roster, &report.repo_id) {
            return Ok(stop);
        }
        self.aggregator
            .handle_no_dataset(&self.coordinator, &mut state, &roster, sender, &report)
    }

    fn training_error(&self, sender: ConnectionId, report: RoundReport) -> Result<Transition> {
        self.require(sender, NodeType::Library, &report.repo_id)?;

        let session = self.session_for(&report.repo_id);
        let mut state = session.lock();
        let roster = self.registry.roster(&report.repo_id);
        self.coordinator.training_error(&mut state, &roster, &report)
    }

    fn require(&self, sender: ConnectionId, node_type: NodeType, repo_id: &str) -> Result<()> {
        if self.registry.is_registered(&sender, node_type, repo_id) {
            return Ok(());
        }
        warn!(
            connection = %sender,
            repo_id = %repo_id,
            node_type = %node_type,
            "Message from unregistered client"
        );
        Err(Error::NotRegistered {
            repo_id: repo_id.to_string(),
            node_type: node_type.to_string(),
        })
    }

    /// A library message arrived for a live session whose dashboard is gone
    fn stop_if_owner_gone(
        &self,
        state: &mut SessionState,
        roster: &Roster,
        repo_id: &str,
    ) -> Option<Transition> {
        if roster.has_dashboard() || !state.is_busy() {
            return None;
        }
        info!(repo_id = %repo_id, "Dashboard gone, stopping session");
        Some(
            self.coordinator
                .stop_session(state, roster, StopReason::OwnerDisconnected),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Dispatch;
    use crate::session::tests::coordinator;
    use crate::session::SessionPhase;
    use node_core::{AggregationConfig, AggregatorError, ClientRegistry, ErrorKind};
    use serde_json::{json, Value};

    fn router(api_key: Option<&str>) -> MessageRouter {
        MessageRouter::new(
            Arc::new(ClientRegistry::new()),
            coordinator(),
            Aggregator::new(AggregationConfig::default(), true),
            AuthConfig {
                api_key: api_key.map(str::to_string),
            },
        )
        .unwrap()
    }

    fn send(router: &MessageRouter, sender: ConnectionId, value: Value) -> Result<Transition> {
        router.route(sender, Inbound::from_value(value)?)
    }

    fn register(router: &MessageRouter, node_type: &str, repo_id: &str) -> ConnectionId {
        let connection = ConnectionId::new();
        send(
            router,
            connection,
            json!({"type": "REGISTER", "node_type": node_type, "repo_id": repo_id, "api_key": "key"}),
        )
        .unwrap();
        connection
    }

    fn new_session(repo_id: &str) -> Value {
        json!({
            "type": "NEW_SESSION",
            "repo_id": repo_id,
            "session_id": "session",
            "hyperparams": {"batch_size": 8},
            "selection_criteria": {"type": "ALL_NODES"},
            "continuation_criteria": {"type": "PERCENTAGE_AVERAGED", "value": 0.5},
            "termination_criteria": {"type": "MAX_ROUND", "value": 3},
            "library_type": "PYTHON",
        })
    }

    fn update(repo_id: &str, round: u64, value: f64) -> Value {
        json!({
            "type": "NEW_UPDATE",
            "repo_id": repo_id,
            "session_id": "session",
            "round": round,
            "results": {"gradients": [[value]], "omega": 1.0},
        })
    }

    #[test]
    fn test_register_replies_success() {
        let router = router(Some("key"));
        let transition = send(
            &router,
            ConnectionId::new(),
            json!({"type": "REGISTER", "node_type": "LIBRARY", "repo_id": "repo", "api_key": "key"}),
        )
        .unwrap();

        let reply = serde_json::to_value(&transition.dispatch).unwrap();
        assert_eq!(
            reply,
            json!({"action": "UNICAST", "message": {"action": "REGISTRATION_SUCCESS", "error": false}})
        );
    }

    #[test]
    fn test_register_rejections() {
        let router = router(Some("key"));
        let connection = ConnectionId::new();

        let err = send(
            &router,
            connection,
            json!({"type": "REGISTER", "node_type": "LIBRARY", "repo_id": "repo", "api_key": "nope"}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(router.registry().registration_count(), 0);

        register(&router, "DASHBOARD", "repo");
        let err = send(
            &router,
            connection,
            json!({"type": "REGISTER", "node_type": "DASHBOARD", "repo_id": "repo", "api_key": "key"}),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Registration(RegistrationError::DashboardSlotFull { .. })
        ));
    }

    #[test]
    fn test_unregistered_sender_rejected() {
        let router = router(None);
        let library = register(&router, "LIBRARY", "repo");

        let err = send(&router, library, new_session("repo")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRegistered);

        let err = send(&router, ConnectionId::new(), update("repo", 1, 1.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRegistered);
        assert_eq!(router.snapshot("repo").unwrap().phase, SessionPhase::Idle);
    }

    #[test]
    fn test_session_round_trip() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        let a = register(&router, "LIBRARY", "repo");
        let b = register(&router, "LIBRARY", "repo");

        let started = send(&router, dashboard, new_session("repo")).unwrap();
        assert_eq!(started.dispatch.recipients(dashboard), vec![a, b]);
        assert_eq!(router.active_sessions(), 1);

        let err = send(&router, dashboard, new_session("repo")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerBusy);

        // 1 of 2 meets 0.5
        let next = send(&router, a, update("repo", 1, 2.0)).unwrap();
        assert!(matches!(next.dispatch.message(), Some(Outbound::Train(t)) if t.round == 2));

        let snapshot = router.snapshot("repo").unwrap();
        assert_eq!(snapshot.current_round, Some(2));
        assert_eq!(snapshot.num_nodes_chosen, 2);

        let err = send(&router, b, update("repo", 1, 2.0)).unwrap_err();
        assert!(matches!(
            err,
            Error::Aggregator(AggregatorError::RoundMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_busy_checked_before_session_config() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        let mut bad_runtime = new_session("repo");
        bad_runtime["library_type"] = json!("IOS");
        let err = send(&router, dashboard, bad_runtime.clone()).unwrap_err();
        assert!(matches!(err, Error::ServerBusy { .. }));

        // The same request on an idle repo is a configuration error
        let idle = register(&router, "DASHBOARD", "idle");
        bad_runtime["repo_id"] = json!("idle");
        let err = send(&router, idle, bad_runtime).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(router.snapshot("idle").unwrap().phase, SessionPhase::Idle);
    }

    #[test]
    fn test_stale_update_reported_as_busy() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        let library = register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        let err = send(&router, library, update("repo", 7, 1.0)).unwrap_err();
        let reply = serde_json::to_value(Dispatch::error(&err)).unwrap();
        assert_eq!(reply["action"], "UNICAST");
        assert_eq!(reply["message"]["error"], true);
        assert_eq!(reply["message"]["type"], "SERVER_BUSY");
    }

    #[test]
    fn test_library_joins_mid_round() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        let late = ConnectionId::new();
        let transition = send(
            &router,
            late,
            json!({"type": "REGISTER", "node_type": "LIBRARY", "repo_id": "repo", "api_key": "k"}),
        )
        .unwrap();
        assert!(matches!(
            transition.dispatch,
            Dispatch::Unicast { message: Outbound::Train(ref t) } if t.round == 1
        ));
        assert_eq!(router.snapshot("repo").unwrap().num_nodes_chosen, 2);

        // The late library may contribute to the running round
        assert!(send(&router, late, update("repo", 1, 1.0)).is_ok());
    }

    #[test]
    fn test_dashboard_disconnect_stops_session() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        let library = register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        // Library disconnects do not touch the session
        let other = register(&router, "LIBRARY", "repo");
        assert!(router.disconnect(other).is_empty());
        assert_eq!(router.active_sessions(), 1);

        let stops = router.disconnect(dashboard);
        assert_eq!(stops.len(), 1);
        match &stops[0].dispatch {
            Dispatch::Broadcast { client_list, message: Outbound::Stop(_) } => {
                assert_eq!(client_list, &vec![library]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(router.active_sessions(), 0);
    }

    #[test]
    fn test_owner_gone_stops_on_library_message() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        let library = register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        // Dashboard vanishes from the registry without a close frame
        router.registry().unregister(&dashboard);

        let transition = send(&router, library, update("repo", 1, 1.0)).unwrap();
        assert!(matches!(transition.dispatch.message(), Some(Outbound::Stop(_))));
        assert_eq!(router.snapshot("repo").unwrap().phase, SessionPhase::Idle);
    }

    #[test]
    fn test_owner_gone_stops_on_no_dataset() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        let library = register(&router, "LIBRARY", "repo");
        register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        router.registry().unregister(&dashboard);

        let transition = send(
            &router,
            library,
            json!({"type": "NO_DATASET", "repo_id": "repo", "session_id": "session", "round": 1}),
        )
        .unwrap();
        assert!(matches!(transition.dispatch.message(), Some(Outbound::Stop(_))));
        assert_eq!(router.snapshot("repo").unwrap().phase, SessionPhase::Idle);
        assert_eq!(router.active_sessions(), 0);
    }

    #[test]
    fn test_demo_enrolment() {
        let router = router(None);
        let register_demo = json!({
            "type": "REGISTER",
            "node_type": "DASHBOARD",
            "repo_id": "repo",
            "api_key": "k",
            "is_demo": true,
        });

        let err = send(&router, ConnectionId::new(), register_demo.clone()).unwrap_err();
        assert!(matches!(
            err,
            Error::Registration(RegistrationError::DemoDeviceUnavailable)
        ));

        let device = register(&router, "LIBRARY", DEMO_REPO);
        let other_repo = register_demo
            .as_object()
            .map(|m| {
                let mut m = m.clone();
                m.insert("repo_id".to_string(), json!("other"));
                Value::Object(m)
            })
            .unwrap();
        send(&router, ConnectionId::new(), other_repo).unwrap();
        assert!(router
            .registry()
            .is_registered(&device, NodeType::Library, "other"));
    }

    #[test]
    fn test_training_error_broadcasts_model_error() {
        let router = router(None);
        let dashboard = register(&router, "DASHBOARD", "repo");
        let library = register(&router, "LIBRARY", "repo");
        send(&router, dashboard, new_session("repo")).unwrap();

        let transition = send(
            &router,
            library,
            json!({"type": "TRAINING_ERROR", "repo_id": "repo", "session_id": "session", "round": 1}),
        )
        .unwrap();
        assert_eq!(
            transition.dispatch.recipients(library),
            vec![library, dashboard]
        );
        match transition.dispatch.message() {
            Some(Outbound::Error(envelope)) => assert_eq!(envelope.kind, ErrorKind::ModelError),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(router.active_sessions(), 0);
    }

    #[test]
    fn test_repos_are_independent() {
        let router = router(None);
        let dash_a = register(&router, "DASHBOARD", "repo-a");
        let dash_b = register(&router, "DASHBOARD", "repo-b");
        register(&router, "LIBRARY", "repo-a");
        register(&router, "LIBRARY", "repo-b");

        send(&router, dash_a, new_session("repo-a")).unwrap();
        send(&router, dash_b, new_session("repo-b")).unwrap();
        assert_eq!(router.active_sessions(), 2);

        router.disconnect(dash_a);
        assert_eq!(router.snapshot("repo-a").unwrap().phase, SessionPhase::Idle);
        assert_eq!(router.snapshot("repo-b").unwrap().phase, SessionPhase::InRound);
        assert!(router.snapshot("unknown").is_none());
    }
}
