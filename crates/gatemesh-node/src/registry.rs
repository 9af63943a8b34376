//! The configured-server registry.
//!
//! Server names are unique case-insensitively and resolvable by unique
//! prefix, the same lookup contract gates use. Servers are created from
//! configuration and never destroyed while configured, only disabled.

use crate::config::ServerEntry;
use crate::server::Server;
use gatemesh_core::{MeshError, MeshResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<Server>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[ServerEntry]) -> MeshResult<Self> {
        let registry = Self::new();
        for entry in entries {
            registry.add(Server::from_entry(entry)?)?;
        }
        Ok(registry)
    }

    pub fn add(&self, server: Server) -> MeshResult<()> {
        let key = server.name().to_lowercase();
        let mut servers = self.servers.write().unwrap();
        if servers.contains_key(&key) {
            return Err(MeshError::Validation(format!(
                "a server named '{}' already exists",
                server.name()
            )));
        }
        servers.insert(key, Arc::new(server));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.write().unwrap().remove(&name.to_lowercase())
    }

    /// Exact lookup, case-insensitive.
    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
    }

    /// Unique-prefix lookup, exact match winning.
    pub fn find(&self, name: &str) -> Option<Arc<Server>> {
        let lower = name.to_lowercase();
        let servers = self.servers.read().unwrap();
        if let Some(server) = servers.get(&lower) {
            return Some(server.clone());
        }
        let mut found = None;
        for (key, server) in servers.iter() {
            if key.starts_with(&lower) {
                if found.is_some() {
                    return None;
                }
                found = Some(server.clone());
            }
        }
        found
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        let mut servers: Vec<Arc<Server>> =
            self.servers.read().unwrap().values().cloned().collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));
        servers
    }

    /// Bind an inbound credential to the server entry it belongs to.
    pub fn match_credential(&self, presented: &str, local_key: &str) -> Option<Arc<Server>> {
        self.servers
            .read()
            .unwrap()
            .values()
            .find(|s| s.expected_credential(local_key) == presented)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().unwrap().is_empty()
    }
}
