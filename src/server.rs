//! Accept loops for the cluster (node) and client ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{handlers, heartbeat, router, transport, MasterCoordinator};

pub(crate) fn start_cluster_listener(
    master: Arc<MasterCoordinator>,
    listener: TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = master.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted node connection");
                    admit_node(&master, stream, peer).await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept node connection");
                }
            }
        }
        debug!("Cluster listener stopped");
    })
}

/// Register the node and start its command and heartbeat sessions. A refused
/// node has its connection dropped.
async fn admit_node(master: &Arc<MasterCoordinator>, stream: TcpStream, peer: SocketAddr) {
    let node = match master
        .cluster
        .register(peer.ip().to_string(), &master.config, &master.cancel)
        .await
    {
        Ok(node) => node,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Refused node connection");
            return;
        }
    };

    let (commands, probes) = transport::attach(
        stream,
        master.config.max_line_len,
        Duration::from_millis(master.config.probe_timeout_ms),
        node.cancel_token().clone(),
    );

    handlers::start_command_session(Arc::clone(master), Arc::clone(&node), commands);
    heartbeat::start_heartbeat_session(Arc::clone(master), node, probes);
}

pub(crate) fn start_client_listener(
    master: Arc<MasterCoordinator>,
    listener: TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = master.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted client connection");
                    tokio::spawn(router::route_client(Arc::clone(&master), stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept client connection");
                }
            }
        }
        debug!("Client listener stopped");
    })
}
