//! Input validation and message metrics for the cloud node
//!
//! Validation runs before a message reaches the session lock, so an
//! oversized or malformed payload never touches session state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use node_core::{Error, ModelTensors, Result};

use crate::message::Inbound;

/// Input validator for inbound messages
pub struct InputValidator {
    /// Maximum repo, session or dataset ID length
    max_id_len: usize,
    /// Maximum top-level hyperparameter entries
    max_hyperparams_entries: usize,
    /// Maximum layers in one update
    max_layers: usize,
    /// Maximum scalars across all layers of one update
    max_elements: usize,
    /// Allowed characters pattern for IDs
    id_pattern: regex::Regex,
}

impl InputValidator {
    /// Create a new input validator with default limits
    pub fn new() -> Result<Self> {
        // Allow alphanumeric, hyphens, underscores, and dots
        let id_pattern = regex::Regex::new(r"^[a-zA-Z0-9_\-\.]+$").map_err(|e| Error::Internal {
            message: format!("invalid id pattern: {e}"),
        })?;
        Ok(Self {
            max_id_len: 256,
            max_hyperparams_entries: 64,
            max_layers: 4096,
            max_elements: 16 * 1024 * 1024,
            id_pattern,
        })
    }

    /// Validate every field of an inbound message that has a limit
    pub fn validate(&self, inbound: &Inbound) -> Result<()> {
        self.validate_id("repo_id", inbound.repo_id())?;
        match inbound {
            Inbound::Register(_) => Ok(()),
            Inbound::NewSession(m) => {
                self.validate_id("session_id", &m.session_id)?;
                self.validate_optional_id("dataset_id", m.dataset_id.as_deref())?;
                self.validate_hyperparams(&m.hyperparams)
            }
            Inbound::NewUpdate(m) => {
                self.validate_id("session_id", &m.session_id)?;
                self.validate_optional_id("dataset_id", m.dataset_id.as_deref())?;
                if let Some(weights) = &m.results.weights {
                    self.validate_tensors(weights)?;
                }
                if let Some(gradients) = &m.results.gradients {
                    self.validate_tensors(gradients)?;
                }
                Ok(())
            }
            Inbound::NoDataset(r) | Inbound::TrainingError(r) => {
                self.validate_id("session_id", &r.session_id)?;
                self.validate_optional_id("dataset_id", r.dataset_id.as_deref())
            }
        }
    }

    /// Validate a repo, session or dataset ID
    pub fn validate_id(&self, field: &str, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(invalid(format!("{field} cannot be empty")));
        }

        if id.len() > self.max_id_len {
            return Err(invalid(format!(
                "{field} exceeds maximum length of {} characters",
                self.max_id_len
            )));
        }

        if !self.id_pattern.is_match(id) {
            return Err(invalid(format!(
                "{field} contains invalid characters. Only alphanumeric, hyphens, underscores, and dots are allowed"
            )));
        }

        Ok(())
    }

    fn validate_optional_id(&self, field: &str, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => self.validate_id(field, id),
            None => Ok(()),
        }
    }

    /// Hyperparameters are forwarded verbatim to every library: they must be
    /// an object (or absent) of bounded size
    pub fn validate_hyperparams(&self, hyperparams: &Value) -> Result<()> {
        match hyperparams {
            Value::Null => Ok(()),
            Value::Object(map) if map.len() <= self.max_hyperparams_entries => Ok(()),
            Value::Object(_) => Err(invalid(format!(
                "hyperparams exceed maximum of {} entries",
                self.max_hyperparams_entries
            ))),
            _ => Err(invalid("hyperparams must be an object".to_string())),
        }
    }

    /// Validate the size of an update payload
    pub fn validate_tensors(&self, tensors: &ModelTensors) -> Result<()> {
        if tensors.is_empty() {
            return Err(invalid("update carries no layers".to_string()));
        }

        if tensors.len() > self.max_layers {
            return Err(invalid(format!(
                "update exceeds maximum of {} layers",
                self.max_layers
            )));
        }

        if tensors.num_elements() > self.max_elements {
            return Err(invalid(format!(
                "update exceeds maximum of {} values",
                self.max_elements
            )));
        }

        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::Deserialization { message }
}

/// Per message type counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStats {
    pub messages: u64,
    pub errors: u64,
    pub p99_latency_us: Option<u64>,
}

/// Message metrics collector
pub struct MessageMetrics {
    /// Total messages by type
    messages: DashMap<String, AtomicU64>,
    /// Errors by type
    errors: DashMap<String, AtomicU64>,
    /// Latency samples (type -> recent latencies in microseconds)
    latencies: DashMap<String, VecDeque<u64>>,
    /// Max latency samples to keep
    max_samples: usize,
}

impl Default for MessageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            errors: DashMap::new(),
            latencies: DashMap::new(),
            max_samples: 1000,
        }
    }

    /// Record a message
    pub fn record_message(&self, message_type: &str) {
        self.messages
            .entry(message_type.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error
    pub fn record_error(&self, message_type: &str) {
        self.errors
            .entry(message_type.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record latency
    pub fn record_latency(&self, message_type: &str, latency_us: u64) {
        let mut entry = self
            .latencies
            .entry(message_type.to_string())
            .or_insert_with(VecDeque::new);
        if entry.len() >= self.max_samples {
            entry.pop_front();
        }
        entry.push_back(latency_us);
    }

    pub fn message_count(&self, message_type: &str) -> u64 {
        self.messages
            .get(message_type)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self, message_type: &str) -> u64 {
        self.errors
            .get(message_type)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get p99 latency for a message type in microseconds
    pub fn p99_latency(&self, message_type: &str) -> Option<u64> {
        self.latencies.get(message_type).and_then(|samples| {
            if samples.is_empty() {
                return None;
            }
            let mut sorted: Vec<_> = samples.iter().copied().collect();
            sorted.sort_unstable();
            let idx = (sorted.len() as f64 * 0.99) as usize;
            sorted.get(idx.min(sorted.len() - 1)).copied()
        })
    }

    /// Get summary of all metrics
    pub fn summary(&self) -> HashMap<String, MessageStats> {
        let mut result = HashMap::new();

        // Types that only ever failed to decode have errors but no messages
        let types = self
            .messages
            .iter()
            .map(|e| e.key().clone())
            .chain(self.errors.iter().map(|e| e.key().clone()));
        for message_type in types {
            if result.contains_key(&message_type) {
                continue;
            }
            let stats = MessageStats {
                messages: self.message_count(&message_type),
                errors: self.error_count(&message_type),
                p99_latency_us: self.p99_latency(&message_type),
            };
            result.insert(message_type, stats);
        }

        debug!(message_types = result.len(), "Metrics summary built");
        result
    }
}
