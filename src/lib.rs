//! syncmaster: coordination master for a distributed file-sync service.
//!
//! Storage nodes register over a line-based control channel. The master
//! tracks which node owns which client account, probes every node with
//! heartbeats, and tells newly connecting clients which node to talk to. File
//! data never passes through the master.
//!
//! # Quick start
//!
//! 1. Construct a [`Config`] (ports, heartbeat and sweep periods).
//! 2. Create a [`MasterCoordinator`] and call [`start`](MasterCoordinator::start).
//! 3. Call [`shutdown`](MasterCoordinator::shutdown) to stop every listener
//!    and session.

pub mod clients;
pub mod cluster;
pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;

mod handlers;
mod heartbeat;
mod router;
mod server;
mod sweeper;

pub use clients::{ClientRecord, ClientRegistry};
pub use cluster::{ClusterRegistry, Lifecycle, NodeId, NodeRecord};
pub use config::Config;
pub use session::Worker;

use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

// ============================================================================
// MasterError
// ============================================================================

/// Errors returned by master operations.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Client already exists: {0}")]
    ClientExists(String),
    #[error("Client not found: {0}")]
    ClientNotFound(String),
    #[error("Host {ip} already has {limit} active node(s)")]
    HostAtCapacity { ip: String, limit: usize },
    #[error("Node {0} is not alive")]
    NodeDead(NodeId),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
}

// ============================================================================
// MasterCoordinator
// ============================================================================

/// The master process: both registries, both listeners, and the sweeper.
pub struct MasterCoordinator {
    pub(crate) clients: ClientRegistry,
    pub(crate) cluster: ClusterRegistry,
    pub(crate) config: Config,
    pub(crate) cancel: CancellationToken,
}

impl MasterCoordinator {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            clients: ClientRegistry::new(),
            cluster: ClusterRegistry::new(),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the cluster and client listeners, then start the accept loops and
    /// the sweeper.
    ///
    /// Returns join handles for the spawned tasks. Per-node and per-client
    /// sessions are spawned by the accept loops and are not included.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, MasterError> {
        let cluster_listener = bind(self.config.cluster_port).await?;
        let client_listener = bind(self.config.client_port).await?;

        info!(
            cluster_port = self.config.cluster_port,
            client_port = self.config.client_port,
            debug = self.config.debug,
            hide_errors = self.config.hide_errors,
            "Master listening"
        );

        Ok(vec![
            server::start_cluster_listener(Arc::clone(self), cluster_listener),
            server::start_client_listener(Arc::clone(self), client_listener),
            sweeper::start_sweeper(Arc::clone(self)),
        ])
    }

    /// Stop the listeners, the sweeper, and every node session.
    pub fn shutdown(&self) {
        info!("Master shutting down");
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterRegistry {
        &self.cluster
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Resolve a client's credentials to the address of its owning node.
    ///
    /// A record whose owner is dead or already removed resolves to `None`.
    pub async fn route(&self, name: &str, password: &str) -> Option<String> {
        let record = self.clients.find(name, password).await?;
        self.cluster.active_ip(record.owner).await
    }

    /// Prune dead nodes (cascading their clients) and report status.
    /// Returns the ids of the pruned nodes.
    pub async fn sweep(&self) -> Vec<NodeId> {
        let pruned = self.cluster.remove_dead(&self.clients).await;
        let status = self.status().await;
        sweeper::report_status(&status, self.config.debug);
        pruned.iter().map(|n| n.id()).collect()
    }

    /// Snapshot of every registered node and client.
    pub async fn status(&self) -> ClusterStatus {
        self.cluster.status(&self.clients).await
    }

    pub async fn suspend_heartbeat(&self, id: NodeId) -> Result<(), MasterError> {
        let node = self
            .cluster
            .find_by_id(id)
            .await
            .ok_or(MasterError::NodeNotFound(id))?;
        node.heartbeat_worker().suspend();
        Ok(())
    }

    pub async fn resume_heartbeat(&self, id: NodeId) -> Result<(), MasterError> {
        let node = self
            .cluster
            .find_by_id(id)
            .await
            .ok_or(MasterError::NodeNotFound(id))?;
        node.heartbeat_worker().resume();
        Ok(())
    }

    // -- Internal helpers --

    /// Tear a node down after one of its sessions ended. Idempotent: the
    /// sibling session, a CLOSE, and the sweeper may all get here.
    pub(crate) async fn retire_node(&self, node: &NodeRecord) {
        node.destroy();
        if self
            .cluster
            .remove_by_id(node.id(), &self.clients)
            .await
            .is_none()
        {
            debug!(node = node.id(), "Node already removed");
        }
    }

    /// Log a session's transport failure, honoring `hide_errors`. A node
    /// already torn down by its sibling session is logged at `debug`.
    pub(crate) fn report_session_failure(
        &self,
        node: &NodeRecord,
        session: &str,
        error: &dyn Display,
    ) {
        let id = node.id();
        if session_failure_level(node.is_alive(), self.config.hide_errors) == Level::WARN {
            warn!(node = id, session, error = %error, "Session ended");
        } else {
            debug!(node = id, session, error = %error, "Session ended");
        }
    }
}

fn session_failure_level(node_alive: bool, hide_errors: bool) -> Level {
    if node_alive && !hide_errors {
        Level::WARN
    } else {
        Level::DEBUG
    }
}

async fn bind(port: u16) -> Result<TcpListener, MasterError> {
    let addr = format!("0.0.0.0:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| MasterError::Bind { addr, source })
}

// ============================================================================
// ClusterStatus
// ============================================================================

/// Snapshot of the master's registries (returned by [`MasterCoordinator::status`]).
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub nodes: Vec<NodeStatus>,
    pub clients: Vec<ClientStatus>,
}

/// One node as seen by a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub ip: String,
    pub priority: i32,
    pub max_clients: u32,
    pub clients: usize,
    pub lifecycle: Lifecycle,
}

/// One client account as seen by a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub name: String,
    pub owner: NodeId,
}
