//! Command session: reads control lines from one node and applies them.
//!
//! Each handler takes the coordinator, the node the session is bound to, and
//! the parsed arguments, and returns the reply to send back. Registry
//! conflicts become negative replies. Only transport failure ends the session.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::NodeRecord;
use crate::protocol::{CommandError, ControlCommand, ControlReply};
use crate::session::Worker;
use crate::transport::CommandChannel;
use crate::{MasterCoordinator, MasterError};

/// What the session does after handling a command.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Reply(ControlReply),
    Close,
}

pub(crate) fn start_command_session(
    master: Arc<MasterCoordinator>,
    node: Arc<NodeRecord>,
    channel: CommandChannel,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker = node.command_worker().clone();
        serve_commands(&master, &node, &worker, channel).await;
        master.retire_node(&node).await;
        debug!(node = node.id(), "Command session stopped");
    })
}

async fn serve_commands(
    master: &MasterCoordinator,
    node: &NodeRecord,
    worker: &Worker,
    mut channel: CommandChannel,
) {
    while worker.checkpoint().await {
        let line = match channel.receive().await {
            Ok(line) => line,
            Err(e) => {
                master.report_session_failure(node, "command", &e);
                return;
            }
        };

        let command = match line.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                warn!(node = node.id(), line = %line, error = %e, "Invalid control command");
                continue;
            }
        };

        match dispatch(master, node, command).await {
            Outcome::Reply(reply) => {
                if let Err(e) = channel.send(&reply.to_string()).await {
                    master.report_session_failure(node, "command", &e);
                    return;
                }
            }
            Outcome::Close => return,
        }
    }
}

async fn dispatch(master: &MasterCoordinator, node: &NodeRecord, command: ControlCommand) -> Outcome {
    match command {
        ControlCommand::Close => handle_close(node),
        ControlCommand::RequestStatus => Outcome::Reply(handle_request_status(master, node).await),
        ControlCommand::AddClient { name, password } => {
            Outcome::Reply(handle_add_client(master, node, &name, &password).await)
        }
        ControlCommand::RemoveClient { name } => {
            Outcome::Reply(handle_remove_client(master, node, &name).await)
        }
        ControlCommand::SetPriority(priority) => {
            Outcome::Reply(handle_set_priority(node, priority))
        }
        ControlCommand::ChangePassword { name, password } => {
            Outcome::Reply(handle_change_password(master, node, &name, &password).await)
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn handle_close(node: &NodeRecord) -> Outcome {
    debug!(node = node.id(), "Node requested close");
    node.destroy();
    Outcome::Close
}

async fn handle_request_status(master: &MasterCoordinator, node: &NodeRecord) -> ControlReply {
    let active = master.cluster.active_count().await;
    let others = if node.is_alive() {
        active.saturating_sub(1)
    } else {
        active
    };
    ControlReply::Status(format!(
        "There are {others} file servers like you are connected"
    ))
}

async fn handle_add_client(
    master: &MasterCoordinator,
    node: &NodeRecord,
    name: &str,
    password: &str,
) -> ControlReply {
    match master.clients.add(name, password, node).await {
        Ok(()) => {
            debug!(node = node.id(), client = %name, "Client added");
            ControlReply::Confirm
        }
        Err(MasterError::ClientExists(_)) => {
            ControlReply::Error("client name already exists".to_string())
        }
        Err(e) => ControlReply::Error(e.to_string()),
    }
}

async fn handle_remove_client(
    master: &MasterCoordinator,
    node: &NodeRecord,
    name: &str,
) -> ControlReply {
    match master.clients.remove(name).await {
        Ok(record) => {
            debug!(node = node.id(), client = %name, owner = record.owner, "Client removed");
            ControlReply::Confirm
        }
        Err(_) => ControlReply::Error("client name not found".to_string()),
    }
}

fn handle_set_priority(node: &NodeRecord, priority: i32) -> ControlReply {
    node.set_priority(priority);
    debug!(node = node.id(), priority, "Priority set");
    ControlReply::Confirm
}

async fn handle_change_password(
    master: &MasterCoordinator,
    node: &NodeRecord,
    name: &str,
    password: &str,
) -> ControlReply {
    match master.clients.change_password(name, password).await {
        Ok(()) => {
            debug!(node = node.id(), client = %name, "Password changed");
            ControlReply::Confirm
        }
        Err(_) => ControlReply::Bad,
    }
}
