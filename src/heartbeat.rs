//! Heartbeat session: periodic liveness probes for one node.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::NodeRecord;
use crate::protocol::HEARTBEAT;
use crate::session::Worker;
use crate::transport::ProbeChannel;
use crate::MasterCoordinator;

pub(crate) fn start_heartbeat_session(
    master: Arc<MasterCoordinator>,
    node: Arc<NodeRecord>,
    channel: ProbeChannel,
) -> JoinHandle<()> {
    let heartbeat_interval = Duration::from_millis(master.config.heartbeat_interval_ms);

    tokio::spawn(async move {
        let worker = node.heartbeat_worker().clone();
        probe_until_failure(&master, &node, &worker, channel, heartbeat_interval).await;
        master.retire_node(&node).await;
        debug!(node = node.id(), "Heartbeat session stopped");
    })
}

async fn probe_until_failure(
    master: &MasterCoordinator,
    node: &NodeRecord,
    worker: &Worker,
    mut channel: ProbeChannel,
    heartbeat_interval: Duration,
) {
    loop {
        if !worker.sleep(heartbeat_interval).await || !worker.checkpoint().await {
            return;
        }

        match channel.send_and_recv(HEARTBEAT).await {
            Ok(reply) if reply == HEARTBEAT => {
                debug!(node = node.id(), "Heartbeat confirmed");
            }
            Ok(reply) => {
                warn!(node = node.id(), reply = %reply, "Unexpected heartbeat reply");
            }
            Err(e) => {
                master.report_session_failure(node, "heartbeat", &e);
                node.mark_dead();
                return;
            }
        }
    }
}
