//! Shared test helpers for syncmaster integration tests.
//!
//! Spins up a master on localhost with real TCP, plus a scripted storage node
//! and a one-shot identifying client to drive it.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use syncmaster::protocol::{Identification, FAIL_MARKER, HEARTBEAT, INFO_MARKER};
use syncmaster::{Config, MasterCoordinator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// How long a test waits for any single reply before giving up.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Port allocation
// ============================================================================

/// Bind to port 0 and return the OS-assigned port.
///
/// The listener is dropped immediately so the master can bind it. There's a
/// small race window, but it's fine for tests.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Master helpers
// ============================================================================

/// A running master. Shuts down when dropped.
pub struct TestMaster {
    pub master: Arc<MasterCoordinator>,
    _handles: Vec<JoinHandle<()>>,
}

impl TestMaster {
    pub fn cluster_port(&self) -> u16 {
        self.master.config().cluster_port
    }

    pub fn client_port(&self) -> u16 {
        self.master.config().client_port
    }
}

impl Drop for TestMaster {
    fn drop(&mut self) {
        self.master.shutdown();
    }
}

/// Start a master with fast timings and no per-host limit. `tweak` adjusts
/// the config before the listeners bind.
pub async fn spawn_master(tweak: impl FnOnce(&mut Config)) -> TestMaster {
    let mut config = Config {
        client_port: free_port(),
        cluster_port: free_port(),
        heartbeat_interval_ms: 50, // Fast for tests
        probe_timeout_ms: 200,
        sweep_interval_ms: 100,
        sessions_per_host: None,
        ..Config::default()
    };
    tweak(&mut config);

    let master = MasterCoordinator::new(config);
    let handles = master.start().await.unwrap();

    TestMaster {
        master,
        _handles: handles,
    }
}

/// Wait until the cluster registry holds exactly `n` nodes (up to `timeout`).
pub async fn wait_for_nodes(master: &MasterCoordinator, n: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if master.cluster().len().await == n {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// FakeNode
// ============================================================================

type LineWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>>;

/// A storage node's control connection.
///
/// A background task reads everything the master sends. Heartbeat probes are
/// answered (unless the node is mute) and never surface to the test; every
/// other line is queued for [`next_line`](Self::next_line).
pub struct FakeNode {
    writer: LineWriter,
    lines: mpsc::UnboundedReceiver<String>,
    reader: JoinHandle<()>,
}

impl FakeNode {
    pub async fn connect(port: u16) -> Self {
        Self::open(port, Some(HEARTBEAT)).await
    }

    /// A node that never answers heartbeats.
    pub async fn connect_mute(port: u16) -> Self {
        Self::open(port, None).await
    }

    /// A node that answers every heartbeat with `reply` instead of an echo.
    pub async fn connect_answering(port: u16, reply: &'static str) -> Self {
        Self::open(port, Some(reply)).await
    }

    async fn open(port: u16, heartbeat_reply: Option<&'static str>) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let writer: LineWriter = Arc::new(Mutex::new(FramedWrite::new(
            write_half,
            LinesCodec::new(),
        )));
        let mut reader = FramedRead::new(read_half, LinesCodec::new());
        let (tx, lines) = mpsc::unbounded_channel();

        let echo = Arc::clone(&writer);
        let reader = tokio::spawn(async move {
            while let Some(Ok(line)) = reader.next().await {
                if line == HEARTBEAT {
                    if let Some(reply) = heartbeat_reply {
                        let _ = echo.lock().await.send(reply).await;
                    }
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self {
            writer,
            lines,
            reader,
        }
    }

    pub async fn send(&self, line: &str) {
        self.writer.lock().await.send(line).await.unwrap();
    }

    /// Next non-heartbeat line from the master, or `None` on timeout or close.
    pub async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(REPLY_TIMEOUT, self.lines.recv())
            .await
            .ok()
            .flatten()
    }

    /// Send a command and return the master's reply.
    pub async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.next_line()
            .await
            .unwrap_or_else(|| panic!("no reply to {line:?}"))
    }

    /// Half-close the connection, as a node does when it exits.
    pub async fn close_write(&self) {
        self.writer.lock().await.get_mut().shutdown().await.unwrap();
    }

    /// Whether the master closes the connection within `timeout`.
    pub async fn expect_closed(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.lines.recv().await.is_some() {}
        })
        .await
        .is_ok()
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ============================================================================
// Client identification
// ============================================================================

/// What a client sees after identifying.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Fail,
    Info(String),
    /// Connection closed without a reply.
    Closed,
}

pub async fn identify(port: u16, name: &str, password: &str) -> RouteOutcome {
    let packet = Identification {
        name: name.to_string(),
        password: password.to_string(),
    };
    identify_raw(port, &packet.to_bytes()).await
}

/// Send arbitrary bytes to the client port and decode the reply.
pub async fn identify_raw(port: u16, bytes: &[u8]) -> RouteOutcome {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(bytes).await.unwrap();

    let marker = match tokio::time::timeout(REPLY_TIMEOUT, stream.read_i32())
        .await
        .expect("route reply timed out")
    {
        Ok(marker) => marker,
        Err(_) => return RouteOutcome::Closed,
    };

    match marker {
        FAIL_MARKER => RouteOutcome::Fail,
        INFO_MARKER => {
            let mut units = Vec::new();
            loop {
                let unit = stream.read_u16().await.unwrap();
                if unit == u16::from(b'\n') {
                    break;
                }
                units.push(unit);
            }
            RouteOutcome::Info(String::from_utf16(&units).unwrap())
        }
        other => panic!("unexpected reply marker {other:#010x}"),
    }
}
