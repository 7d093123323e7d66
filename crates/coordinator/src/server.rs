//! WebSocket transport and server lifecycle
//!
//! Each WebSocket connection gets a [`ConnectionId`] and an outbox in the
//! [`ConnectionTable`]. Text frames go through the service one at a time per
//! connection; the resulting dispatch is fanned out through the outboxes of
//! its recipients. The HTTP status API runs on its own listener.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use node_core::{ConnectionId, Error, Result, ServerConfig};

use crate::http_api;
use crate::message::Dispatch;
use crate::service::CloudNodeService;

/// Outboxes of the live connections
#[derive(Default)]
pub struct ConnectionTable {
    outboxes: DashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection, returning the receiving end of its outbox
    pub fn open(&self, connection: ConnectionId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(connection, tx);
        rx
    }

    pub fn close(&self, connection: &ConnectionId) {
        self.outboxes.remove(connection);
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }

    /// Queue `dispatch` for its recipients. Returns how many outboxes took
    /// the message; closed connections are skipped.
    pub fn deliver(&self, sender: ConnectionId, dispatch: &Dispatch) -> usize {
        let Some(message) = dispatch.message() else {
            return 0;
        };
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode outbound message");
                return 0;
            }
        };

        let mut delivered = 0;
        for recipient in dispatch.recipients(sender) {
            match self.outboxes.get(&recipient) {
                Some(outbox) if outbox.send(Message::Text(text.clone())).is_ok() => delivered += 1,
                _ => debug!(connection = %recipient, "Recipient no longer connected"),
            }
        }
        delivered
    }
}

/// State shared by WebSocket handlers
#[derive(Clone)]
pub struct WsState {
    pub service: CloudNodeService,
    pub connections: Arc<ConnectionTable>,
    pub max_message_size: usize,
    pub ping_interval: Duration,
}

/// Create the WebSocket router, served at `/` and `/ws`
pub fn create_ws_router(state: WsState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    let max = state.max_message_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let connection = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let mut outbox = state.connections.open(connection);
    info!(connection = %connection, "Client connected");

    let ping_interval = state.ping_interval;
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                outgoing = outbox.recv() => match outgoing {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(connection = %connection, error = %e, "WebSocket read failed");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                let dispatch = state.service.handle_text(connection, &text).await;
                state.connections.deliver(connection, &dispatch);
            }
            Message::Binary(_) => {
                let e = Error::Deserialization {
                    message: "binary frames are not supported".to_string(),
                };
                state.connections.deliver(connection, &Dispatch::error(&e));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.connections.close(&connection);
    for dispatch in state.service.handle_disconnect(connection).await {
        state.connections.deliver(connection, &dispatch);
    }
    let _ = writer.await;
    info!(connection = %connection, "Client disconnected");
}

/// Cloud node server: WebSocket endpoint plus HTTP status API
pub struct CloudNodeServer {
    config: ServerConfig,
    service: CloudNodeService,
}

impl CloudNodeServer {
    pub fn new(service: CloudNodeService, config: ServerConfig) -> Self {
        Self { config, service }
    }

    /// Run both listeners until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run both listeners until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ws_addr = socket_addr(&self.config.bind_address, self.config.ws_port)?;
        let http_addr = socket_addr(&self.config.bind_address, self.config.http_port)?;

        let ws_app = create_ws_router(WsState {
            service: self.service.clone(),
            connections: Arc::new(ConnectionTable::new()),
            max_message_size: self.config.max_message_size,
            ping_interval: self.config.ping_interval,
        });
        let http_app = http_api::create_router(Arc::new(self.service));

        let ws_listener = TcpListener::bind(ws_addr).await?;
        let http_listener = TcpListener::bind(http_addr).await?;
        info!(address = %ws_addr, "WebSocket endpoint listening");
        info!(address = %http_addr, "HTTP API listening");

        let (stop_tx, stop_rx) = watch::channel(());
        tokio::spawn(async move {
            shutdown.await;
            let _ = stop_tx.send(());
        });

        let ws = axum::serve(ws_listener, ws_app)
            .with_graceful_shutdown(stopped(stop_rx.clone()))
            .into_future();
        let http = axum::serve(http_listener, http_app)
            .with_graceful_shutdown(stopped(stop_rx))
            .into_future();

        let (ws_result, http_result) = tokio::join!(ws, http);
        ws_result.map_err(|e| {
            error!(error = %e, "WebSocket server error");
            Error::Io(e)
        })?;
        http_result.map_err(|e| {
            error!(error = %e, "HTTP server error");
            Error::Io(e)
        })?;

        info!("Cloud node shutdown complete");
        Ok(())
    }
}

fn socket_addr(bind_address: &str, port: u16) -> Result<SocketAddr> {
    format!("{bind_address}:{port}")
        .parse()
        .map_err(|e| Error::InvalidConfig {
            message: format!("invalid bind address {bind_address}:{port}: {e}"),
        })
}

async fn stopped(mut rx: watch::Receiver<()>) {
    let _ = rx.changed().await;
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
