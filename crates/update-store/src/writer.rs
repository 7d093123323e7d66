//! Background writer task for non-blocking persistence
//!
//! Requests are applied strictly in arrival order. A write that fails with a
//! retryable error is attempted again up to the configured retry count.

use bytes::Bytes;
use node_core::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::StorageBackend;

/// Request to persist one object
#[derive(Debug)]
pub struct WriteRequest {
    /// Storage key
    pub key: String,

    /// Serialized object
    pub data: Bytes,

    /// Completion notification; `None` for fire-and-forget writes
    pub ack: Option<oneshot::Sender<Result<u64>>>,
}

/// Commands understood by the writer task
#[derive(Debug)]
pub enum WriterCommand {
    Write(WriteRequest),

    /// Resolves once every previously queued write has been attempted
    Flush(oneshot::Sender<()>),
}

/// Event reported by the writer
#[derive(Debug, Clone)]
pub enum WriterEvent {
    Completed {
        key: String,
        size_bytes: u64,
        attempts: u32,
    },
    Failed {
        key: String,
        error: String,
        attempts: u32,
    },
}

/// Writer tuning
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub queue_depth: usize,
    pub timeout: Duration,
    pub retries: u32,
}

/// Handle to the spawned writer task
pub struct UpdateWriter {
    _task: tokio::task::JoinHandle<()>,
}

impl UpdateWriter {
    /// Spawn the writer; it stops once every command sender is dropped
    pub fn spawn(
        backend: Arc<dyn StorageBackend>,
        config: WriterConfig,
        event_tx: mpsc::Sender<WriterEvent>,
    ) -> (mpsc::Sender<WriterCommand>, Self) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let task = tokio::spawn(Self::writer_loop(backend, config, rx, event_tx));
        (tx, Self { _task: task })
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        config: WriterConfig,
        mut rx: mpsc::Receiver<WriterCommand>,
        event_tx: mpsc::Sender<WriterEvent>,
    ) {
        info!("Update writer started");

        while let Some(command) = rx.recv().await {
            let request = match command {
                WriterCommand::Write(request) => request,
                WriterCommand::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
            };

            let start = Instant::now();
            let (result, attempts) = Self::write_with_retry(backend.as_ref(), &config, &request).await;

            let event = match &result {
                Ok(size) => {
                    debug!(
                        key = %request.key,
                        size_bytes = size,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Object persisted"
                    );
                    WriterEvent::Completed {
                        key: request.key.clone(),
                        size_bytes: *size,
                        attempts,
                    }
                }
                Err(e) => {
                    error!(key = %request.key, attempts, error = %e, "Failed to persist object");
                    WriterEvent::Failed {
                        key: request.key.clone(),
                        error: e.to_string(),
                        attempts,
                    }
                }
            };

            if let Some(ack) = request.ack {
                let _ = ack.send(result);
            }
            let _ = event_tx.send(event).await;
        }

        info!("Update writer stopped");
    }

    async fn write_with_retry(
        backend: &dyn StorageBackend,
        config: &WriterConfig,
        request: &WriteRequest,
    ) -> (Result<u64>, u32) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(
                config.timeout,
                backend.write(&request.key, request.data.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: format!("write {}", request.key),
                    timeout_ms: config.timeout.as_millis() as u64,
                }),
            };

            match result {
                Err(e) if e.is_retryable() && attempts <= config.retries => {
                    warn!(key = %request.key, attempt = attempts, error = %e, "Retrying write");
                }
                other => return (other, attempts),
            }
        }
    }
}
