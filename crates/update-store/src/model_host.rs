//! Model hosting for weight-mode sessions
//!
//! Clients on weight-mode runtimes download the model for each round instead
//! of receiving it inline. The host publishes a format-tagged artifact per
//! round and hands back the URI clients fetch it from.

use async_trait::async_trait;
use bytes::Bytes;
use node_core::{Error, ModelFormat, ModelTensors, Result, Round};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::StorageBackend;

/// Model fetch and publish collaborator
#[async_trait]
pub trait ModelHost: Send + Sync {
    /// URI the model for `round` is (or will be) published at
    fn locate(&self, repo_id: &str, session_id: &str, round: Round, format: ModelFormat) -> String;

    /// Publish the session's initial model as the round 1 model
    async fn publish_initial(
        &self,
        repo_id: &str,
        session_id: &str,
        format: ModelFormat,
    ) -> Result<String>;

    /// Publish aggregated weights as the model for `round`
    async fn publish(
        &self,
        repo_id: &str,
        session_id: &str,
        round: Round,
        format: ModelFormat,
        weights: &ModelTensors,
    ) -> Result<String>;
}

/// Hosted artifact
#[derive(Debug, Serialize, Deserialize)]
pub struct HostedModel {
    pub format: ModelFormat,
    pub repo_id: String,
    pub session_id: String,
    pub round: Round,
    pub weights: ModelTensors,
}

/// `ModelHost` writing artifacts through a storage backend
pub struct StoredModelHost {
    backend: Arc<dyn StorageBackend>,
    public_base: String,
}

impl StoredModelHost {
    /// `public_base` is the prefix clients prepend to storage keys
    pub fn new(backend: Arc<dyn StorageBackend>, public_base: impl Into<String>) -> Self {
        Self {
            backend,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Where a dashboard uploads the starting weights of a session
    pub fn initial_model_key(repo_id: &str, session_id: &str) -> String {
        format!("{repo_id}/{session_id}/initial/model.json")
    }

    pub fn model_key(repo_id: &str, session_id: &str, round: Round, format: ModelFormat) -> String {
        format!("{repo_id}/{session_id}/{round}/model.{}", format.extension())
    }

    /// Read a published artifact back
    pub async fn fetch(
        &self,
        repo_id: &str,
        session_id: &str,
        round: Round,
        format: ModelFormat,
    ) -> Result<HostedModel> {
        let raw = self
            .backend
            .read(&Self::model_key(repo_id, session_id, round, format))
            .await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl ModelHost for StoredModelHost {
    fn locate(&self, repo_id: &str, session_id: &str, round: Round, format: ModelFormat) -> String {
        format!(
            "{}/{}",
            self.public_base,
            Self::model_key(repo_id, session_id, round, format)
        )
    }

    async fn publish_initial(
        &self,
        repo_id: &str,
        session_id: &str,
        format: ModelFormat,
    ) -> Result<String> {
        let key = Self::initial_model_key(repo_id, session_id);
        let raw = self.backend.read(&key).await?;
        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        let weights = ModelTensors::from_json(&value).map_err(|e| Error::Storage {
            message: format!("initial model {key} is unusable: {e}"),
        })?;
        self.publish(repo_id, session_id, 1, format, &weights).await
    }

    async fn publish(
        &self,
        repo_id: &str,
        session_id: &str,
        round: Round,
        format: ModelFormat,
        weights: &ModelTensors,
    ) -> Result<String> {
        let artifact = HostedModel {
            format,
            repo_id: repo_id.to_string(),
            session_id: session_id.to_string(),
            round,
            weights: weights.clone(),
        };
        let key = Self::model_key(repo_id, session_id, round, format);
        let size = self
            .backend
            .write(&key, Bytes::from(serde_json::to_vec(&artifact)?))
            .await?;

        info!(
            repo_id = %repo_id,
            session_id = %session_id,
            round,
            format = %format,
            size_bytes = size,
            "Model published"
        );
        Ok(self.locate(repo_id, session_id, round, format))
    }
}
