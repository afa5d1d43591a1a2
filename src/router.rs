//! One-shot client routing: identify, look up the owner, reply, close.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::{IdentifyCodec, RouteReply};
use crate::MasterCoordinator;

/// Serve exactly one identification request on `stream`.
///
/// A bad marker or a dropped connection ends the exchange without a reply.
/// The connection closes when this returns.
pub(crate) async fn route_client(master: Arc<MasterCoordinator>, stream: TcpStream, peer: SocketAddr) {
    let codec = IdentifyCodec::new(master.config.max_name_len, master.config.max_password_len);
    let mut framed = Framed::new(stream, codec);

    let reply = match framed.next().await {
        Some(Ok(ident)) => match master.route(&ident.name, &ident.password).await {
            Some(ip) => {
                debug!(peer = %peer, client = %ident.name, node_ip = %ip, "Client routed");
                RouteReply::Info(ip)
            }
            None => {
                debug!(peer = %peer, client = %ident.name, "Unknown client credentials");
                RouteReply::Fail
            }
        },
        Some(Err(e)) if e.wants_reply() => {
            debug!(peer = %peer, error = %e, "Rejected identification");
            RouteReply::Fail
        }
        Some(Err(e)) => {
            debug!(peer = %peer, error = %e, "Dropping client connection");
            return;
        }
        None => {
            debug!(peer = %peer, "Client disconnected before identifying");
            return;
        }
    };

    if let Err(e) = framed.send(reply).await {
        debug!(peer = %peer, error = %e, "Failed to send route reply");
    }
}
