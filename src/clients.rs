//! Client accounts and their owning nodes.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;
use tracing::debug;

use crate::cluster::{NodeId, NodeRecord};
use crate::{ClientStatus, MasterError};

/// One client account. `owner` is a lookup key into the cluster registry,
/// not a reference that keeps the node around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub name: String,
    pub password: String,
    pub owner: NodeId,
}

#[derive(Debug, Default)]
struct ClientTable {
    records: HashMap<String, ClientRecord>,
    /// Each node's client set, kept in step with `records`.
    by_owner: HashMap<NodeId, BTreeSet<String>>,
}

impl ClientTable {
    fn detach(&mut self, owner: NodeId, name: &str) {
        if let Some(names) = self.by_owner.get_mut(&owner) {
            names.remove(name);
            if names.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

/// Registry of client accounts, unique by name across the whole cluster.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    table: RwLock<ClientTable>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.table.read().await.records.contains_key(name)
    }

    /// Find a record matching both name and password.
    pub async fn find(&self, name: &str, password: &str) -> Option<ClientRecord> {
        let table = self.table.read().await;
        table
            .records
            .get(name)
            .filter(|r| r.password == password)
            .cloned()
    }

    /// Add a client owned by `owner`.
    ///
    /// The uniqueness check and the insert are one critical section. A node
    /// that is already dead cannot take new clients, since its cascade may
    /// already have run.
    pub async fn add(
        &self,
        name: &str,
        password: &str,
        owner: &NodeRecord,
    ) -> Result<(), MasterError> {
        let mut table = self.table.write().await;

        if table.records.contains_key(name) {
            return Err(MasterError::ClientExists(name.to_string()));
        }
        if !owner.is_alive() {
            return Err(MasterError::NodeDead(owner.id()));
        }

        table.records.insert(
            name.to_string(),
            ClientRecord {
                name: name.to_string(),
                password: password.to_string(),
                owner: owner.id(),
            },
        );
        table
            .by_owner
            .entry(owner.id())
            .or_default()
            .insert(name.to_string());
        debug!(client = %name, node = owner.id(), "Added client");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<ClientRecord, MasterError> {
        let mut table = self.table.write().await;
        let record = table
            .records
            .remove(name)
            .ok_or_else(|| MasterError::ClientNotFound(name.to_string()))?;
        table.detach(record.owner, name);
        debug!(client = %name, node = record.owner, "Removed client");
        Ok(record)
    }

    /// Remove every client owned by `owner`. Returns the removed names.
    pub async fn remove_cascade(&self, owner: NodeId) -> Vec<String> {
        let mut table = self.table.write().await;
        let names: Vec<String> = table
            .by_owner
            .remove(&owner)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for name in &names {
            table.records.remove(name);
        }
        names
    }

    pub async fn change_password(&self, name: &str, password: &str) -> Result<(), MasterError> {
        let mut table = self.table.write().await;
        let record = table
            .records
            .get_mut(name)
            .ok_or_else(|| MasterError::ClientNotFound(name.to_string()))?;
        record.password = password.to_string();
        Ok(())
    }

    /// Names of the clients owned by `owner`, sorted.
    pub async fn owned_by(&self, owner: NodeId) -> Vec<String> {
        let table = self.table.read().await;
        table
            .by_owner
            .get(&owner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count_owned_by(&self, owner: NodeId) -> usize {
        let table = self.table.read().await;
        table.by_owner.get(&owner).map_or(0, |set| set.len())
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.records.is_empty()
    }

    /// Name/owner pairs sorted by name. Passwords are not included.
    pub async fn snapshot(&self) -> Vec<ClientStatus> {
        let table = self.table.read().await;
        let mut view: Vec<ClientStatus> = table
            .records
            .values()
            .map(|r| ClientStatus {
                name: r.name.clone(),
                owner: r.owner,
            })
            .collect();
        view.sort_by(|a, b| a.name.cmp(&b.name));
        view
    }
}
