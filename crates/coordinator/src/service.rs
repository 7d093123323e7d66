//! Cloud node service
//!
//! Wires the router to its collaborators. Each message is routed under its
//! repo's lock; the resulting effects (model publishing, checkpoints, event
//! logging) then run with the lock released, and only after they have run is
//! the dispatch handed back to the transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use node_core::{ClientRegistry, ClientRegistryHandle, CloudNodeConfig, ConnectionId, Result};
use update_store::{ModelHost, StorageBackend, StoredModelHost, UpdateStore};

use crate::aggregator::Aggregator;
use crate::message::{Dispatch, Inbound};
use crate::middleware::MessageMetrics;
use crate::router::MessageRouter;
use crate::session::{Coordinator, SessionSnapshot};
use crate::transition::{Effect, ModelSource, Transition};

/// Metrics key for frames that never decoded into a message
const UNDECODED: &str = "UNDECODED";

/// Cloud node service
#[derive(Clone)]
pub struct CloudNodeService {
    /// Registry, sessions and routing
    router: Arc<MessageRouter>,

    /// Checkpoints and event log
    store: Arc<UpdateStore>,

    /// Publishes models for weight-mode sessions
    model_host: Arc<dyn ModelHost>,

    /// Per message type counters
    metrics: Arc<MessageMetrics>,

    /// Longest a joining library waits for its model to be hosted
    model_wait: Duration,

    /// Service start time for uptime tracking
    start_time: Instant,
}

impl CloudNodeService {
    /// Create a service persisting and hosting models through `backend`.
    /// Must be called inside a tokio runtime.
    pub fn new(config: &CloudNodeConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let store = Arc::new(UpdateStore::new(backend.clone(), &config.store));
        let model_host: Arc<dyn ModelHost> = Arc::new(StoredModelHost::new(
            backend,
            config.store.model_base_url.clone(),
        ));
        Self::with_components(config, store, model_host)
    }

    /// Create a service from existing collaborators
    pub fn with_components(
        config: &CloudNodeConfig,
        store: Arc<UpdateStore>,
        model_host: Arc<dyn ModelHost>,
    ) -> Result<Self> {
        let registry: ClientRegistryHandle = Arc::new(ClientRegistry::new());
        let router = MessageRouter::new(
            registry,
            Coordinator::new(model_host.clone()),
            Aggregator::new(config.aggregation, config.store.checkpoint_on_termination),
            config.auth.clone(),
        )?;

        Ok(Self {
            router: Arc::new(router),
            store,
            model_host,
            metrics: Arc::new(MessageMetrics::new()),
            model_wait: config.store.write_timeout,
            start_time: Instant::now(),
        })
    }

    /// Handle a text frame. Failures become a unicast error envelope.
    pub async fn handle_text(&self, sender: ConnectionId, text: &str) -> Dispatch {
        match Inbound::decode(text) {
            Ok(inbound) => self.handle_message(sender, inbound).await,
            Err(e) => {
                self.metrics.record_error(UNDECODED);
                warn!(
                    connection = %sender,
                    error = %e,
                    kind = e.kind().as_str(),
                    "Undecodable message"
                );
                Dispatch::error(&e)
            }
        }
    }

    /// Handle a decoded message
    pub async fn handle_message(&self, sender: ConnectionId, inbound: Inbound) -> Dispatch {
        let message_type = inbound.message_type().as_str();
        let started = Instant::now();
        self.metrics.record_message(message_type);

        let dispatch = match self.router.route(sender, inbound) {
            Ok(transition) => self.apply(transition).await,
            Err(e) => {
                self.metrics.record_error(message_type);
                warn!(
                    connection = %sender,
                    message_type,
                    error = %e,
                    kind = e.kind().as_str(),
                    "Message rejected"
                );
                Dispatch::error(&e)
            }
        };

        self.metrics
            .record_latency(message_type, started.elapsed().as_micros() as u64);
        dispatch
    }

    /// A connection closed. Returns the STOP broadcasts of every session it
    /// owned.
    pub async fn handle_disconnect(&self, connection: ConnectionId) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        for transition in self.router.disconnect(connection) {
            dispatches.push(self.apply(transition).await);
        }
        dispatches
    }

    /// Run a transition's effects in order, then release its dispatch
    async fn apply(&self, transition: Transition) -> Dispatch {
        for effect in &transition.effects {
            if let Err(e) = self.run_effect(effect).await {
                // Persistence and publishing never abort a round
                warn!(effect = effect_name(effect), error = %e, "Effect failed");
            }
        }
        transition.dispatch
    }

    async fn run_effect(&self, effect: &Effect) -> Result<()> {
        match effect {
            Effect::PublishModel {
                repo_id,
                session_id,
                round,
                format,
                source,
                ready,
            } => {
                let published = match source {
                    ModelSource::Initial => {
                        self.model_host
                            .publish_initial(repo_id, session_id, *format)
                            .await
                    }
                    ModelSource::Aggregate(weights) => {
                        self.model_host
                            .publish(repo_id, session_id, *round, *format, weights)
                            .await
                    }
                };
                ready.open();
                let uri = published?;
                debug!(repo_id = %repo_id, round, uri = %uri, "Model ready");
            }
            Effect::AwaitModel { ready } => {
                if tokio::time::timeout(self.model_wait, ready.opened())
                    .await
                    .is_err()
                {
                    warn!(
                        timeout_ms = self.model_wait.as_millis() as u64,
                        "Model not hosted in time, sending TRAIN anyway"
                    );
                }
            }
            Effect::Checkpoint {
                repo_id,
                session_id,
                round,
                kind,
                payload,
            } => {
                self.store
                    .checkpoint(repo_id, session_id, *round, *kind, payload)
                    .await?;
            }
            Effect::LogEvent {
                kind,
                repo_id,
                session_id,
                payload,
            } => {
                self.store
                    .log_event(*kind, repo_id, session_id, payload.clone())
                    .await?;
            }
        }
        Ok(())
    }

    pub fn session_snapshot(&self, repo_id: &str) -> Option<SessionSnapshot> {
        self.router.snapshot(repo_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.router.active_sessions()
    }

    pub fn registry(&self) -> &ClientRegistryHandle {
        self.router.registry()
    }

    pub fn store(&self) -> &Arc<UpdateStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MessageMetrics> {
        &self.metrics
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

fn effect_name(effect: &Effect) -> &'static str {
    match effect {
        Effect::PublishModel { .. } => "publish_model",
        Effect::AwaitModel { .. } => "await_model",
        Effect::Checkpoint { .. } => "checkpoint",
        Effect::LogEvent { .. } => "log_event",
    }
}
