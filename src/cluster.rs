//! In-memory cluster membership: node records, lifecycle, and the registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clients::ClientRegistry;
use crate::session::Worker;
use crate::{ClusterStatus, Config, MasterError, NodeStatus};

/// Identifier assigned to a node when it registers. Never reused.
pub type NodeId = u32;

/// Lifecycle of a registered node. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum Lifecycle {
    Active = 0,
    Dead = 1,
    Removed = 2,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Active,
            1 => Lifecycle::Dead,
            _ => Lifecycle::Removed,
        }
    }
}

/// One registered storage node.
///
/// Identity fields are fixed at registration. Priority and lifecycle are
/// atomics so sessions can update them without holding the registry lock.
/// The node's client set lives in [`ClientRegistry`], indexed by owner.
#[derive(Debug)]
pub struct NodeRecord {
    id: NodeId,
    ip: String,
    max_clients: u32,
    priority: AtomicI32,
    lifecycle: AtomicU8,
    cancel: CancellationToken,
    heartbeat: Worker,
    commands: Worker,
}

impl NodeRecord {
    pub(crate) fn new(
        id: NodeId,
        ip: String,
        max_clients: u32,
        priority: i32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ip,
            max_clients,
            priority: AtomicI32::new(priority),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            heartbeat: Worker::new(cancel.child_token()),
            commands: Worker::new(cancel.child_token()),
            cancel,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn max_clients(&self) -> u32 {
        self.max_clients
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    /// Bounds are the caller's concern.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    /// Worker handle for this node's heartbeat session.
    pub fn heartbeat_worker(&self) -> &Worker {
        &self.heartbeat
    }

    /// Worker handle for this node's command session.
    pub fn command_worker(&self) -> &Worker {
        &self.commands
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move Active → Dead. Returns true only for the call that made the
    /// transition.
    pub(crate) fn mark_dead(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Active as u8,
                Lifecycle::Dead as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Mark dead and stop both sessions. Safe to call any number of times.
    pub(crate) fn destroy(&self) -> bool {
        let first = self.mark_dead();
        self.cancel.cancel();
        first
    }

    fn mark_removed(&self) {
        self.lifecycle
            .fetch_max(Lifecycle::Removed as u8, Ordering::SeqCst);
    }
}

/// Registry of every node currently known to the master.
///
/// Lock order: a caller holding this registry's lock may take the
/// [`ClientRegistry`] lock, never the reverse.
#[derive(Debug)]
pub struct ClusterRegistry {
    next_id: AtomicU32,
    nodes: RwLock<BTreeMap<NodeId, Arc<NodeRecord>>>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create and insert a fresh node for a newly accepted control connection.
    ///
    /// The per-host admission check and the insert happen under one lock.
    pub async fn register(
        &self,
        ip: String,
        config: &Config,
        parent: &CancellationToken,
    ) -> Result<Arc<NodeRecord>, MasterError> {
        let mut nodes = self.nodes.write().await;

        let on_host = nodes
            .values()
            .filter(|n| n.is_alive() && n.ip() == ip)
            .count();
        if !config.admits_host(on_host) {
            return Err(MasterError::HostAtCapacity {
                ip,
                limit: config.sessions_per_host.unwrap_or_default(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(NodeRecord::new(
            id,
            ip,
            config.default_max_clients,
            config.default_priority,
            parent.child_token(),
        ));
        Self::insert_locked(&mut nodes, Arc::clone(&node));
        Ok(node)
    }

    /// Insert an already-built node. Panics if the id is already registered.
    pub async fn insert(&self, node: Arc<NodeRecord>) {
        let mut nodes = self.nodes.write().await;
        Self::insert_locked(&mut nodes, node);
    }

    fn insert_locked(nodes: &mut BTreeMap<NodeId, Arc<NodeRecord>>, node: Arc<NodeRecord>) {
        assert!(
            !nodes.contains_key(&node.id()),
            "node id {} registered twice",
            node.id()
        );
        info!(node = node.id(), ip = %node.ip(), "Registered node");
        nodes.insert(node.id(), node);
    }

    pub async fn find_by_id(&self, id: NodeId) -> Option<Arc<NodeRecord>> {
        self.nodes.read().await.get(&id).cloned()
    }

    /// Prune every node that is no longer active, cascading its clients out of
    /// `clients` in the same critical section.
    pub async fn remove_dead(&self, clients: &ClientRegistry) -> Vec<Arc<NodeRecord>> {
        let mut nodes = self.nodes.write().await;

        let dead: Vec<NodeId> = nodes
            .values()
            .filter(|n| !n.is_alive())
            .map(|n| n.id())
            .collect();

        let mut pruned = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(node) = nodes.remove(&id) {
                node.destroy();
                let dropped = clients.remove_cascade(id).await;
                node.mark_removed();
                info!(node = id, clients = dropped.len(), "Removed dead node");
                pruned.push(node);
            }
        }
        pruned
    }

    /// Destroy and remove one node, cascading its clients. Removing an absent
    /// id is a no-op.
    pub async fn remove_by_id(
        &self,
        id: NodeId,
        clients: &ClientRegistry,
    ) -> Option<Arc<NodeRecord>> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.remove(&id)?;

        node.destroy();
        let dropped = clients.remove_cascade(id).await;
        node.mark_removed();
        info!(node = id, clients = dropped.len(), "Removed node");
        Some(node)
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    pub async fn active_count(&self) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_alive())
            .count()
    }

    /// Resolve a node to its IP if it is registered and still active.
    pub async fn active_ip(&self, id: NodeId) -> Option<String> {
        let nodes = self.nodes.read().await;
        nodes
            .get(&id)
            .filter(|n| n.is_alive())
            .map(|n| n.ip().to_string())
    }

    /// Consistent snapshot of both registries.
    pub async fn status(&self, clients: &ClientRegistry) -> ClusterStatus {
        let nodes = self.nodes.read().await;
        let client_view = clients.snapshot().await;

        let nodes = nodes
            .values()
            .map(|n| NodeStatus {
                id: n.id(),
                ip: n.ip().to_string(),
                priority: n.priority(),
                max_clients: n.max_clients(),
                clients: client_view.iter().filter(|c| c.owner == n.id()).count(),
                lifecycle: n.lifecycle(),
            })
            .collect();

        ClusterStatus {
            nodes,
            clients: client_view,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, ip: &str) -> Arc<NodeRecord> {
        Arc::new(NodeRecord::new(
            id,
            ip.to_string(),
            10,
            5,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let n = node(1, "10.0.0.1");
        assert!(n.is_alive());
        assert!(n.mark_dead());
        assert!(!n.mark_dead(), "second transition should report false");
        n.mark_removed();
        assert_eq!(n.lifecycle(), Lifecycle::Removed);
        assert!(!n.mark_dead());
        assert_eq!(n.lifecycle(), Lifecycle::Removed);
    }

    #[test]
    fn destroy_stops_both_sessions() {
        let n = node(1, "10.0.0.1");
        assert!(n.destroy());
        assert!(n.heartbeat_worker().is_stopped());
        assert!(n.command_worker().is_stopped());
        assert!(!n.destroy());
    }

    #[tokio::test]
    async fn register_assigns_increasing_ids() {
        let registry = ClusterRegistry::new();
        let config = Config {
            sessions_per_host: None,
            ..Config::default()
        };
        let root = CancellationToken::new();

        let a = registry
            .register("10.0.0.1".into(), &config, &root)
            .await
            .unwrap();
        let b = registry
            .register("10.0.0.1".into(), &config, &root)
            .await
            .unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(a.priority(), config.default_priority);
        assert_eq!(a.max_clients(), config.default_max_clients);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn register_enforces_per_host_limit() {
        let registry = ClusterRegistry::new();
        let config = Config {
            sessions_per_host: Some(1),
            ..Config::default()
        };
        let root = CancellationToken::new();

        let first = registry
            .register("10.0.0.1".into(), &config, &root)
            .await
            .unwrap();
        let refused = registry
            .register("10.0.0.1".into(), &config, &root)
            .await;
        assert!(matches!(
            refused,
            Err(MasterError::HostAtCapacity { limit: 1, .. })
        ));

        // Another host is unaffected.
        registry
            .register("10.0.0.2".into(), &config, &root)
            .await
            .unwrap();

        // A dead node no longer counts against its host.
        first.mark_dead();
        registry
            .register("10.0.0.1".into(), &config, &root)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "registered twice")]
    async fn duplicate_insert_panics() {
        let registry = ClusterRegistry::new();
        registry.insert(node(7, "10.0.0.1")).await;
        registry.insert(node(7, "10.0.0.2")).await;
    }

    #[tokio::test]
    async fn remove_dead_cascades_and_is_idempotent() {
        let registry = ClusterRegistry::new();
        let clients = ClientRegistry::new();
        let a = node(1, "10.0.0.1");
        let b = node(2, "10.0.0.2");
        registry.insert(Arc::clone(&a)).await;
        registry.insert(Arc::clone(&b)).await;

        clients.add("alice", "pw", &a).await.unwrap();
        clients.add("bob", "pw", &b).await.unwrap();

        a.mark_dead();
        let pruned = registry.remove_dead(&clients).await;
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id(), 1);
        assert_eq!(a.lifecycle(), Lifecycle::Removed);

        assert!(registry.find_by_id(1).await.is_none());
        assert!(!clients.exists("alice").await);
        assert!(clients.exists("bob").await);
        assert!(b.is_alive());

        let again = registry.remove_dead(&clients).await;
        assert!(again.is_empty());
        assert_eq!(registry.len().await, 1);
        assert_eq!(clients.len().await, 1);
    }

    #[tokio::test]
    async fn remove_by_id_destroys_and_tolerates_absent() {
        let registry = ClusterRegistry::new();
        let clients = ClientRegistry::new();
        let a = node(1, "10.0.0.1");
        registry.insert(Arc::clone(&a)).await;
        clients.add("alice", "pw", &a).await.unwrap();

        let removed = registry.remove_by_id(1, &clients).await;
        assert!(removed.is_some());
        assert!(a.heartbeat_worker().is_stopped());
        assert!(!clients.exists("alice").await);

        assert!(registry.remove_by_id(1, &clients).await.is_none());
        assert!(registry.remove_by_id(42, &clients).await.is_none());
    }

    #[tokio::test]
    async fn active_ip_hides_dead_nodes() {
        let registry = ClusterRegistry::new();
        let a = node(1, "10.0.0.5");
        registry.insert(Arc::clone(&a)).await;

        assert_eq!(registry.active_ip(1).await.as_deref(), Some("10.0.0.5"));
        a.mark_dead();
        assert_eq!(registry.active_ip(1).await, None);
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn status_counts_clients_per_node() {
        let registry = ClusterRegistry::new();
        let clients = ClientRegistry::new();
        let a = node(1, "10.0.0.1");
        let b = node(2, "10.0.0.2");
        registry.insert(Arc::clone(&a)).await;
        registry.insert(Arc::clone(&b)).await;
        clients.add("alice", "pw", &a).await.unwrap();
        clients.add("carol", "pw", &a).await.unwrap();
        clients.add("bob", "pw", &b).await.unwrap();

        let status = registry.status(&clients).await;
        assert_eq!(status.nodes.len(), 2);
        assert_eq!(status.nodes[0].clients, 2);
        assert_eq!(status.nodes[1].clients, 1);
        assert_eq!(status.clients.len(), 3);
    }
}
