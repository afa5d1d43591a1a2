//! Line transport for a node's control connection.
//!
//! A node holds a single TCP connection to the master. It carries the node's
//! administrative commands and the master's heartbeat probes. A background
//! reader task splits inbound lines: heartbeat echoes go to the
//! [`ProbeChannel`] and everything else to the [`CommandChannel`]. While a
//! probe is waiting, the first line that is not a control verb also counts as
//! its reply, so a node that answers a probe with something unexpected is
//! still heard by the heartbeat session. Both endpoints write through one
//! shared, mutex-guarded line writer.
//!
//! The reader stops when the node's cancellation token fires or the peer
//! closes the connection. Either way both endpoints see
//! [`TransportError::ConnectionClosed`] on their next read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{is_control_verb, HEARTBEAT};

/// Commands buffered ahead of a slow or suspended command session.
const COMMAND_QUEUE: usize = 64;
/// Heartbeat echoes buffered ahead of the probe.
const PROBE_QUEUE: usize = 4;

/// Error type for control channel operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Line codec error: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

type LineWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>>;
type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;

/// Command half of a node's control connection.
#[derive(Debug)]
pub struct CommandChannel {
    writer: LineWriter,
    inbox: mpsc::Receiver<String>,
}

impl CommandChannel {
    /// Block until the node sends its next command line.
    pub async fn receive(&mut self) -> Result<String, TransportError> {
        self.inbox
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    pub async fn send(&self, line: &str) -> Result<(), TransportError> {
        send_line(&self.writer, line).await
    }
}

/// Heartbeat half of a node's control connection.
#[derive(Debug)]
pub struct ProbeChannel {
    writer: LineWriter,
    replies: mpsc::Receiver<String>,
    reply_timeout: Duration,
    pending: Arc<AtomicBool>,
}

impl ProbeChannel {
    /// Send `line` and wait for the node's reply.
    pub async fn send_and_recv(&mut self, line: &str) -> Result<String, TransportError> {
        // Discard stale echoes so this probe pairs with its own reply.
        while self.replies.try_recv().is_ok() {}

        self.pending.store(true, Ordering::SeqCst);
        let result = self.await_reply(line).await;
        self.pending.store(false, Ordering::SeqCst);
        result
    }

    async fn await_reply(&mut self, line: &str) -> Result<String, TransportError> {
        send_line(&self.writer, line).await?;

        match tokio::time::timeout(self.reply_timeout, self.replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout(self.reply_timeout)),
        }
    }
}

async fn send_line(writer: &LineWriter, line: &str) -> Result<(), TransportError> {
    let mut writer = writer.lock().await;
    writer.send(line).await?;
    Ok(())
}

/// Split an accepted node connection into its two endpoints and start the
/// reader task.
pub fn attach(
    stream: TcpStream,
    max_line_len: usize,
    reply_timeout: Duration,
    cancel: CancellationToken,
) -> (CommandChannel, ProbeChannel) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let writer = Arc::new(Mutex::new(FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(max_line_len),
    )));
    let reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_len));

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (probe_tx, probe_rx) = mpsc::channel(PROBE_QUEUE);
    let pending = Arc::new(AtomicBool::new(false));

    tokio::spawn(demux(
        reader,
        command_tx,
        probe_tx,
        Arc::clone(&pending),
        cancel,
    ));

    (
        CommandChannel {
            writer: Arc::clone(&writer),
            inbox: command_rx,
        },
        ProbeChannel {
            writer,
            replies: probe_rx,
            reply_timeout,
            pending,
        },
    )
}

/// A heartbeat echo always goes to the probe. Any other line that isn't a
/// command answers the probe currently waiting, if there is one. Claiming a
/// reply clears `pending`.
fn is_probe_reply(line: &str, pending: &AtomicBool) -> bool {
    match line.split_whitespace().next() {
        Some(HEARTBEAT) => {
            pending.store(false, Ordering::SeqCst);
            true
        }
        Some(token) if !is_control_verb(token) => pending.swap(false, Ordering::SeqCst),
        _ => false,
    }
}

async fn demux(
    mut reader: LineReader,
    commands: mpsc::Sender<String>,
    probes: mpsc::Sender<String>,
    pending: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(line)) if is_probe_reply(&line, &pending) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = probes.try_send(line) {
                    warn!("Dropping unsolicited heartbeat echo");
                }
            }
            Some(Ok(line)) => {
                let delivered = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = commands.send(line) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "Control channel read failed");
                break;
            }
            None => {
                debug!("Control channel closed by peer");
                break;
            }
        }
    }
}
