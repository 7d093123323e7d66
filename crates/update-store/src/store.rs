//! Update store: durable checkpoints of round aggregates and the session
//! event log
//!
//! Layout under the backend:
//! - `{repo}/{session}/{round}/aggregate.json` for checkpoints
//! - `{repo}/{session}/events/{event_id}.json` for events

use bytes::Bytes;
use chrono::{DateTime, Utc};
use node_core::{Error, ModelTensors, RepoId, Result, Round, SessionId, StoreConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::writer::{UpdateWriter, WriteRequest, WriterCommand, WriterConfig, WriterEvent};
use crate::StorageBackend;

/// Why a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointKind {
    /// Periodic checkpoint after a completed round
    RoundCompleted,

    /// Final aggregate of a terminated session
    SessionCompleted,
}

/// Session lifecycle events recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    SessionStarted,
    RoundCompleted,
    SessionStopped,
    TrainingError,
}

/// A persisted checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub repo_id: RepoId,
    pub session_id: SessionId,
    pub round: Round,
    pub kind: CheckpointKind,
    pub key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// A logged event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub kind: EventKind,
    pub repo_id: RepoId,
    pub session_id: SessionId,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// On-disk checkpoint document
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointDocument {
    repo_id: RepoId,
    session_id: SessionId,
    round: Round,
    kind: CheckpointKind,
    created_at: DateTime<Utc>,
    aggregate: ModelTensors,
}

/// Counters maintained from writer events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub completed: u64,
    pub failed: u64,
    pub bytes_written: u64,
}

type SessionKey = (RepoId, SessionId);

/// Checkpoint and event-log collaborator
pub struct UpdateStore {
    backend: Arc<dyn StorageBackend>,

    /// Known checkpoints per session, ordered by round
    checkpoints: Arc<RwLock<HashMap<SessionKey, BTreeMap<Round, CheckpointRecord>>>>,

    /// Most recent events, oldest first
    events: Arc<RwLock<VecDeque<EventRecord>>>,

    max_events: usize,

    stats: Arc<RwLock<WriteStats>>,

    write_tx: mpsc::Sender<WriterCommand>,

    _writer: UpdateWriter,
}

impl UpdateStore {
    /// Create a store writing through `backend`; must be called inside a
    /// tokio runtime
    pub fn new(backend: Arc<dyn StorageBackend>, config: &StoreConfig) -> Self {
        let stats = Arc::new(RwLock::new(WriteStats::default()));
        let (event_tx, mut event_rx) = mpsc::channel(config.write_queue_depth.max(1));

        let (write_tx, writer) = UpdateWriter::spawn(
            backend.clone(),
            WriterConfig {
                queue_depth: config.write_queue_depth,
                timeout: config.write_timeout,
                retries: config.write_retries,
            },
            event_tx,
        );

        let stats_clone = stats.clone();
        tokio::spawn(async move {
            debug!("Update store event listener started");
            while let Some(event) = event_rx.recv().await {
                let mut stats = stats_clone.write();
                match event {
                    WriterEvent::Completed { size_bytes, .. } => {
                        stats.completed += 1;
                        stats.bytes_written += size_bytes;
                    }
                    WriterEvent::Failed { key, error, .. } => {
                        stats.failed += 1;
                        warn!(key = %key, error = %error, "Update store write failed");
                    }
                }
            }
            debug!("Update store event listener stopped");
        });

        Self {
            backend,
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(VecDeque::new())),
            max_events: config.max_events.max(1),
            stats,
            write_tx,
            _writer: writer,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn checkpoint_key(repo_id: &str, session_id: &str, round: Round) -> String {
        format!("{repo_id}/{session_id}/{round}/aggregate.json")
    }

    /// Persist `payload` as the aggregate of `round` and wait until it is
    /// durable
    pub async fn checkpoint(
        &self,
        repo_id: &str,
        session_id: &str,
        round: Round,
        kind: CheckpointKind,
        payload: &ModelTensors,
    ) -> Result<CheckpointRecord> {
        let created_at = Utc::now();
        let document = CheckpointDocument {
            repo_id: repo_id.to_string(),
            session_id: session_id.to_string(),
            round,
            kind,
            created_at,
            aggregate: payload.clone(),
        };
        let data = Bytes::from(serde_json::to_vec(&document)?);
        let key = Self::checkpoint_key(repo_id, session_id, round);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(WriteRequest {
            key: key.clone(),
            data,
            ack: Some(ack_tx),
        })
        .await?;

        let size_bytes = ack_rx.await.map_err(|_| Error::ChannelClosed {
            channel: "update writer ack".to_string(),
        })??;

        let record = CheckpointRecord {
            repo_id: repo_id.to_string(),
            session_id: session_id.to_string(),
            round,
            kind,
            key,
            size_bytes,
            created_at,
        };

        self.checkpoints
            .write()
            .entry((record.repo_id.clone(), record.session_id.clone()))
            .or_default()
            .insert(round, record.clone());

        info!(
            repo_id = %repo_id,
            session_id = %session_id,
            round,
            kind = ?kind,
            size_bytes,
            "Checkpoint persisted"
        );
        Ok(record)
    }

    /// Append an event to the log and queue it for persistence without
    /// waiting for the write
    pub async fn log_event(
        &self,
        kind: EventKind,
        repo_id: &str,
        session_id: &str,
        content: serde_json::Value,
    ) -> Result<EventRecord> {
        let record = EventRecord {
            id: Uuid::new_v4(),
            kind,
            repo_id: repo_id.to_string(),
            session_id: session_id.to_string(),
            content,
            timestamp: Utc::now(),
        };
        let data = Bytes::from(serde_json::to_vec(&record)?);

        {
            let mut events = self.events.write();
            if events.len() >= self.max_events {
                events.pop_front();
            }
            events.push_back(record.clone());
        }
        self.submit(WriteRequest {
            key: format!("{repo_id}/{session_id}/events/{}.json", record.id),
            data,
            ack: None,
        })
        .await?;

        debug!(repo_id = %repo_id, session_id = %session_id, kind = ?kind, "Event logged");
        Ok(record)
    }

    /// Read a checkpointed aggregate back
    pub async fn load_checkpoint(
        &self,
        repo_id: &str,
        session_id: &str,
        round: Round,
    ) -> Result<ModelTensors> {
        let raw = self
            .backend
            .read(&Self::checkpoint_key(repo_id, session_id, round))
            .await?;
        let document: CheckpointDocument = serde_json::from_slice(&raw)?;
        Ok(document.aggregate)
    }

    /// Checkpoints recorded for a session, oldest first
    pub fn checkpoints(&self, repo_id: &str, session_id: &str) -> Vec<CheckpointRecord> {
        self.checkpoints
            .read()
            .get(&(repo_id.to_string(), session_id.to_string()))
            .map(|rounds| rounds.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_checkpoint(&self, repo_id: &str, session_id: &str) -> Option<CheckpointRecord> {
        self.checkpoints
            .read()
            .get(&(repo_id.to_string(), session_id.to_string()))
            .and_then(|rounds| rounds.values().next_back().cloned())
    }

    /// Events logged for a repo, in logging order
    pub fn events(&self, repo_id: &str) -> Vec<EventRecord> {
        self.events
            .read()
            .iter()
            .filter(|e| e.repo_id == repo_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> WriteStats {
        *self.stats.read()
    }

    /// Wait until every write queued so far has been attempted
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(WriterCommand::Flush(done_tx)).await?;
        done_rx.await.map_err(|_| Error::ChannelClosed {
            channel: "update writer flush".to_string(),
        })
    }

    async fn submit(&self, request: WriteRequest) -> Result<()> {
        self.send(WriterCommand::Write(request)).await
    }

    async fn send(&self, command: WriterCommand) -> Result<()> {
        self.write_tx
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed {
                channel: "update writer".to_string(),
            })
    }
}
