//! Cloud node configuration types

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Main cloud node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudNodeConfig {
    /// Transport settings
    pub server: ServerConfig,

    /// Registration authentication
    pub auth: AuthConfig,

    /// Round-advancement policy knobs
    pub aggregation: AggregationConfig,

    /// Update store settings
    pub store: StoreConfig,
}

impl CloudNodeConfig {
    /// Load a JSON configuration file; missing sections fall back to defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: CloudNodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.ws_port == self.server.http_port {
            return Err(Error::InvalidConfig {
                message: format!(
                    "WebSocket and HTTP ports must differ (both {})",
                    self.server.ws_port
                ),
            });
        }
        if self.server.max_message_size == 0 {
            return Err(Error::InvalidConfig {
                message: "max_message_size must be positive".to_string(),
            });
        }
        if self.server.ping_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "ping_interval must be positive".to_string(),
            });
        }
        if self.store.write_queue_depth == 0 {
            return Err(Error::InvalidConfig {
                message: "write_queue_depth must be positive".to_string(),
            });
        }
        if self.store.max_events == 0 {
            return Err(Error::InvalidConfig {
                message: "max_events must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind both listeners to
    pub bind_address: String,

    /// Port for the WebSocket endpoint
    pub ws_port: u16,

    /// Port for the HTTP status API
    pub http_port: u16,

    /// Largest accepted WebSocket frame in bytes
    pub max_message_size: usize,

    /// Interval between server-initiated pings
    #[serde(with = "millis_serde")]
    pub ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            ws_port: 8999,
            http_port: 9999,
            max_message_size: 256 * 1024 * 1024, // 256MB
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Registration authentication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared API key; `None` accepts any key
    pub api_key: Option<String>,
}

impl AuthConfig {
    pub fn accepts(&self, api_key: &str) -> bool {
        match &self.api_key {
            Some(expected) => expected == api_key,
            None => true,
        }
    }
}

/// Round-advancement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// An empty cohort satisfies PERCENTAGE_AVERAGED immediately, so the
    /// first update to arrive completes the round
    pub empty_cohort_continues: bool,

    /// PERCENTAGE_AVERAGED is met when `averaged / chosen >= value`
    /// (`false` requires strictly greater)
    pub inclusive_threshold: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            empty_cohort_continues: true,
            inclusive_threshold: true,
        }
    }
}

/// Update store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for checkpoints, events and hosted models
    pub base_path: String,

    /// Public prefix clients use to download hosted models
    pub model_base_url: String,

    /// Capacity of the background writer queue
    pub write_queue_depth: usize,

    /// Give up on a single write after this long
    #[serde(with = "millis_serde")]
    pub write_timeout: Duration,

    /// Number of extra attempts for retryable write failures
    pub write_retries: u32,

    /// Checkpoint the final aggregate when a session terminates
    pub checkpoint_on_termination: bool,

    /// Events kept in memory; the oldest are dropped first
    pub max_events: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: "./updatestore".to_string(),
            model_base_url: "file://./updatestore".to_string(),
            write_queue_depth: 64,
            write_timeout: Duration::from_secs(60),
            write_retries: 2,
            checkpoint_on_termination: true,
            max_events: 10_000,
        }
    }
}

/// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
