//! Periodic membership sweep and status report.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::{ClusterStatus, MasterCoordinator};

/// Emit at `info` when `$verbose`, otherwise at `debug`.
macro_rules! report {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

pub(crate) fn start_sweeper(master: Arc<MasterCoordinator>) -> JoinHandle<()> {
    let period = Duration::from_millis(master.config.sweep_interval_ms);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = master.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let pruned = master.sweep().await;
            if !pruned.is_empty() {
                debug!(?pruned, "Sweep pruned dead nodes");
            }
        }
        debug!("Sweeper stopped");
    })
}

pub(crate) fn report_status(status: &ClusterStatus, verbose: bool) {
    report!(
        verbose,
        nodes = status.nodes.len(),
        clients = status.clients.len(),
        "Cluster status"
    );
    for node in &status.nodes {
        report!(
            verbose,
            node = node.id,
            ip = %node.ip,
            priority = node.priority,
            max_clients = node.max_clients,
            clients = node.clients,
            lifecycle = ?node.lifecycle,
            "Node"
        );
    }
    for client in &status.clients {
        report!(verbose, client = %client.name, owner = client.owner, "Client");
    }
}
