//! Cloud node binary entry point
//!
//! Usage: `cloud-node [config.json]`. The `CLOUD_NODE_API_KEY` environment
//! variable overrides the configured API key.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::{CloudNodeServer, CloudNodeService};
use node_core::CloudNodeConfig;
use update_store::LocalStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cloud_node=info,coordinator=info,node_core=info,update_store=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration");
            CloudNodeConfig::from_file(&path)?
        }
        None => CloudNodeConfig::default(),
    };
    if let Ok(api_key) = std::env::var("CLOUD_NODE_API_KEY") {
        config.auth.api_key = Some(api_key);
    }
    config.validate()?;

    if config.auth.api_key.is_none() {
        tracing::warn!("No API key configured, accepting every registration");
    }

    tracing::info!(
        ws_port = config.server.ws_port,
        http_port = config.server.http_port,
        store = %config.store.base_path,
        "Starting cloud node"
    );

    let backend = Arc::new(LocalStorage::new(&config.store.base_path));
    let service = CloudNodeService::new(&config, backend)?;
    CloudNodeServer::new(service, config.server).run().await?;

    Ok(())
}
