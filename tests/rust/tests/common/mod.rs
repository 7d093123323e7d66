//! Shared helpers for cloud node integration tests

#![allow(dead_code)]

use std::sync::Arc;

use coordinator::{CloudNodeService, Dispatch};
use node_core::{CloudNodeConfig, ConnectionId};
use serde_json::{json, Value};
use update_store::StorageBackend;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("coordinator=debug,update_store=debug")
        .with_test_writer()
        .try_init();
}

pub fn service(config: &CloudNodeConfig, backend: Arc<dyn StorageBackend>) -> CloudNodeService {
    CloudNodeService::new(config, backend).expect("service should build")
}

/// A simulated client connection
#[derive(Clone)]
pub struct Client {
    pub id: ConnectionId,
    service: CloudNodeService,
}

impl Client {
    pub fn new(service: &CloudNodeService) -> Self {
        Self {
            id: ConnectionId::new(),
            service: service.clone(),
        }
    }

    pub async fn send(&self, message: Value) -> Dispatch {
        self.service.handle_text(self.id, &message.to_string()).await
    }

    /// Send and return the dispatch as wire JSON
    pub async fn send_json(&self, message: Value) -> Value {
        serde_json::to_value(self.send(message).await).expect("dispatch serializes")
    }

    pub async fn register(&self, node_type: &str, repo_id: &str, api_key: &str) -> Value {
        self.send_json(json!({
            "type": "REGISTER",
            "node_type": node_type,
            "repo_id": repo_id,
            "api_key": api_key,
        }))
        .await
    }
}

pub fn new_session(repo_id: &str, session_id: &str, threshold: f64, max_round: u64) -> Value {
    json!({
        "type": "NEW_SESSION",
        "repo_id": repo_id,
        "session_id": session_id,
        "hyperparams": {"batch_size": 32, "epochs": 1},
        "selection_criteria": {"type": "ALL_NODES"},
        "continuation_criteria": {"type": "PERCENTAGE_AVERAGED", "value": threshold},
        "termination_criteria": {"type": "MAX_ROUND", "value": max_round},
        "checkpoint_frequency": 2,
        "library_type": "PYTHON",
    })
}

pub fn gradients(repo_id: &str, session_id: &str, round: u64, values: Value, omega: f64) -> Value {
    json!({
        "type": "NEW_UPDATE",
        "repo_id": repo_id,
        "session_id": session_id,
        "round": round,
        "results": {"gradients": values, "omega": omega},
    })
}

/// Client ids of a dispatch, in wire form
pub fn recipients(dispatch: &Value) -> Vec<String> {
    dispatch["client_list"]
        .as_array()
        .map(|list| list.iter().filter_map(|c| c.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

impl Client {
    pub async fn disconnect(&self) -> Vec<Dispatch> {
        self.service.handle_disconnect(self.id).await
    }
}
