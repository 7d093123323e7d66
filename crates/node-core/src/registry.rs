//! Client registry: which connections are registered, in which role, for
//! which repository

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{ConnectionId, NodeType, RegistrationError, RepoId};

/// Connections registered under one repository, in registration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub libraries: Vec<ConnectionId>,
    pub dashboards: Vec<ConnectionId>,
}

impl Roster {
    /// Every LIBRARY then every DASHBOARD connection
    pub fn participants(&self) -> Vec<ConnectionId> {
        self.libraries
            .iter()
            .chain(self.dashboards.iter())
            .copied()
            .collect()
    }

    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.libraries.contains(connection) || self.dashboards.contains(connection)
    }

    pub fn has_dashboard(&self) -> bool {
        !self.dashboards.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty() && self.dashboards.is_empty()
    }

    fn role_mut(&mut self, node_type: NodeType) -> &mut Vec<ConnectionId> {
        match node_type {
            NodeType::Library => &mut self.libraries,
            NodeType::Dashboard => &mut self.dashboards,
        }
    }
}

/// A (repo, role) pair a connection was registered under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub repo_id: RepoId,
    pub node_type: NodeType,
}

/// Thread-safe client registry.
///
/// Each repository's roster lives behind its own map entry, so register,
/// unregister and reads for one repo are atomic with respect to each other.
pub struct ClientRegistry {
    repos: DashMap<RepoId, Roster>,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            repos: DashMap::new(),
        }
    }

    /// Register `connection` as `node_type` for `repo_id`.
    ///
    /// At most one DASHBOARD per repo; a connection can appear only once per
    /// repo, whatever the role.
    pub fn register(
        &self,
        connection: ConnectionId,
        node_type: NodeType,
        repo_id: &str,
    ) -> Result<(), RegistrationError> {
        let mut roster = self.repos.entry(repo_id.to_string()).or_default();

        if roster.contains(&connection) {
            warn!(connection = %connection, repo_id = %repo_id, "Duplicate registration rejected");
            return Err(RegistrationError::AlreadyRegistered {
                repo_id: repo_id.to_string(),
            });
        }

        if node_type == NodeType::Dashboard && roster.has_dashboard() {
            warn!(connection = %connection, repo_id = %repo_id, "Dashboard slot already taken");
            return Err(RegistrationError::DashboardSlotFull {
                repo_id: repo_id.to_string(),
            });
        }

        roster.role_mut(node_type).push(connection);

        info!(
            connection = %connection,
            repo_id = %repo_id,
            node_type = %node_type,
            "Client registered"
        );
        Ok(())
    }

    /// Remove `connection` from every repo and role it is registered under.
    /// Returns whether it was registered anywhere.
    pub fn unregister(&self, connection: &ConnectionId) -> bool {
        !self.remove_everywhere(connection).is_empty()
    }

    /// Remove `connection` everywhere and report what it was registered as.
    ///
    /// A removed DASHBOARD membership means the owner of that repo's session
    /// is gone; the caller decides what to do with the session.
    pub fn remove_everywhere(&self, connection: &ConnectionId) -> Vec<Membership> {
        let mut removed = Vec::new();

        self.repos.retain(|repo_id, roster| {
            for node_type in [NodeType::Library, NodeType::Dashboard] {
                let members = roster.role_mut(node_type);
                if let Some(pos) = members.iter().position(|c| c == connection) {
                    members.remove(pos);
                    removed.push(Membership {
                        repo_id: repo_id.clone(),
                        node_type,
                    });
                }
            }
            !roster.is_empty()
        });

        for membership in &removed {
            info!(
                connection = %connection,
                repo_id = %membership.repo_id,
                node_type = %membership.node_type,
                "Client unregistered"
            );
        }

        removed
    }

    /// Check whether `connection` is registered as `node_type` for `repo_id`
    pub fn is_registered(&self, connection: &ConnectionId, node_type: NodeType, repo_id: &str) -> bool {
        self.repos
            .get(repo_id)
            .map(|roster| match node_type {
                NodeType::Library => roster.libraries.contains(connection),
                NodeType::Dashboard => roster.dashboards.contains(connection),
            })
            .unwrap_or(false)
    }

    /// Snapshot of a repo's connections
    pub fn roster(&self, repo_id: &str) -> Roster {
        self.repos
            .get(repo_id)
            .map(|roster| roster.clone())
            .unwrap_or_default()
    }

    /// Whether the repo currently has its DASHBOARD connected
    pub fn has_dashboard(&self, repo_id: &str) -> bool {
        self.repos
            .get(repo_id)
            .map(|roster| roster.has_dashboard())
            .unwrap_or(false)
    }

    /// Number of repos with at least one registered connection
    pub fn repo_count(&self) -> usize {
        self.repos.len()
    }

    /// Total registrations across all repos
    pub fn registration_count(&self) -> usize {
        self.repos
            .iter()
            .map(|entry| entry.value().libraries.len() + entry.value().dashboards.len())
            .sum()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to the client registry
pub type ClientRegistryHandle = Arc<ClientRegistry>;
