//! Wire formats spoken by the master.
//!
//! Two protocols live here:
//!
//! - **Control lines** exchanged with storage nodes: one whitespace-separated,
//!   verb-first text line per request and one line per reply.
//! - **Identification packets** sent by clients: a big-endian `i32` marker
//!   followed by two `'\n'`-terminated fields of big-endian UTF-16 code units.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// ============================================================================
// Control lines
// ============================================================================

/// Probe sent by the heartbeat session and echoed back by a healthy node.
pub const HEARTBEAT: &str = "HEARTBEAT";

pub const VERB_CLOSE: &str = "CLOSE";
pub const VERB_REQUEST_STATUS: &str = "REQUEST_STATUS";
pub const VERB_ADD_CLIENT: &str = "ADD_CLIENT";
pub const VERB_REMOVE_CLIENT: &str = "REMOVE_CLIENT";
pub const VERB_SET_PRIORITY: &str = "SET_PRIORITY";
pub const VERB_CHANGE_PASSWORD: &str = "CHANGE_PASSWORD";

const CONTROL_VERBS: [&str; 6] = [
    VERB_CLOSE,
    VERB_REQUEST_STATUS,
    VERB_ADD_CLIENT,
    VERB_REMOVE_CLIENT,
    VERB_SET_PRIORITY,
    VERB_CHANGE_PASSWORD,
];

/// Whether `token` names an administrative command.
pub fn is_control_verb(token: &str) -> bool {
    CONTROL_VERBS.contains(&token)
}

/// An administrative command received on a node's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Close,
    RequestStatus,
    AddClient { name: String, password: String },
    RemoveClient { name: String },
    SetPriority(i32),
    ChangePassword { name: String, password: String },
}

/// Why a control line could not be turned into a [`ControlCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command line")]
    Empty,
    #[error("Unknown verb: {0}")]
    UnknownVerb(String),
    #[error("{verb} takes {expected} argument(s), got {got}")]
    Arity {
        verb: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Invalid priority: {0}")]
    InvalidPriority(String),
}

fn expect_args(verb: &'static str, args: &[&str], expected: usize) -> Result<(), CommandError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(CommandError::Arity {
            verb,
            expected,
            got: args.len(),
        })
    }
}

impl FromStr for ControlCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().ok_or(CommandError::Empty)?;
        let args: Vec<&str> = tokens.collect();

        match verb {
            VERB_CLOSE => {
                expect_args(VERB_CLOSE, &args, 0)?;
                Ok(ControlCommand::Close)
            }
            VERB_REQUEST_STATUS => {
                expect_args(VERB_REQUEST_STATUS, &args, 0)?;
                Ok(ControlCommand::RequestStatus)
            }
            VERB_ADD_CLIENT => {
                expect_args(VERB_ADD_CLIENT, &args, 2)?;
                Ok(ControlCommand::AddClient {
                    name: args[0].to_string(),
                    password: args[1].to_string(),
                })
            }
            VERB_REMOVE_CLIENT => {
                expect_args(VERB_REMOVE_CLIENT, &args, 1)?;
                Ok(ControlCommand::RemoveClient {
                    name: args[0].to_string(),
                })
            }
            VERB_SET_PRIORITY => {
                expect_args(VERB_SET_PRIORITY, &args, 1)?;
                let priority = args[0]
                    .parse::<i32>()
                    .map_err(|_| CommandError::InvalidPriority(args[0].to_string()))?;
                Ok(ControlCommand::SetPriority(priority))
            }
            VERB_CHANGE_PASSWORD => {
                expect_args(VERB_CHANGE_PASSWORD, &args, 2)?;
                Ok(ControlCommand::ChangePassword {
                    name: args[0].to_string(),
                    password: args[1].to_string(),
                })
            }
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }
}

/// A reply line sent back on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Confirm,
    /// Rendered as `ERRMES <message>`.
    Error(String),
    Bad,
    /// Free-text status, sent as-is.
    Status(String),
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlReply::Confirm => f.write_str("CONFIRM"),
            ControlReply::Error(message) => write!(f, "ERRMES {message}"),
            ControlReply::Bad => f.write_str("BAD"),
            ControlReply::Status(text) => f.write_str(text),
        }
    }
}

// ============================================================================
// Client identification
// ============================================================================

/// Marker that opens every identification packet ("DBOX").
pub const IDENTIFY_MARKER: i32 = 0x4442_4F58;
/// Reply marker for a failed identification ("FAIL").
pub const FAIL_MARKER: i32 = 0x4641_494C;
/// Reply marker preceding the owning node's address ("INFO").
pub const INFO_MARKER: i32 = 0x494E_464F;

const TERMINATOR: u16 = b'\n' as u16;

/// Credentials carried by an identification packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub name: String,
    pub password: String,
}

impl Identification {
    /// Encode as a client would put it on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32(IDENTIFY_MARKER);
        put_utf16_line(&mut buf, &self.name);
        put_utf16_line(&mut buf, &self.password);
        buf.to_vec()
    }
}

/// The master's answer to an identification packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteReply {
    Fail,
    /// Address of the node that owns the account.
    Info(String),
}

#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("Bad identification marker: {0:#010x}")]
    BadMarker(i32),
    #[error("Client {field} reached {max} characters without a terminator")]
    FieldTooLong { field: &'static str, max: usize },
    #[error("Client {field} is not valid UTF-16")]
    InvalidText { field: &'static str },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IdentifyError {
    /// Whether the client should still get a failure reply. A bad marker or a
    /// broken connection gets nothing.
    pub fn wants_reply(&self) -> bool {
        matches!(
            self,
            IdentifyError::FieldTooLong { .. } | IdentifyError::InvalidText { .. }
        )
    }
}

/// Decodes [`Identification`] packets and encodes [`RouteReply`] frames.
#[derive(Debug, Clone)]
pub struct IdentifyCodec {
    max_name_len: usize,
    max_password_len: usize,
}

impl IdentifyCodec {
    pub fn new(max_name_len: usize, max_password_len: usize) -> Self {
        Self {
            max_name_len,
            max_password_len,
        }
    }
}

/// Scan one terminated UTF-16 field. Returns the code units and the number of
/// bytes consumed (terminator included), or `None` if more input is needed.
fn scan_field(
    buf: &[u8],
    max: usize,
    field: &'static str,
) -> Result<Option<(Vec<u16>, usize)>, IdentifyError> {
    let mut units = Vec::new();
    for (i, pair) in buf.chunks_exact(2).enumerate() {
        let unit = u16::from_be_bytes([pair[0], pair[1]]);
        if unit == TERMINATOR {
            return Ok(Some((units, (i + 1) * 2)));
        }
        units.push(unit);
        if units.len() >= max {
            return Err(IdentifyError::FieldTooLong { field, max });
        }
    }
    Ok(None)
}

fn put_utf16_line(dst: &mut BytesMut, text: &str) {
    for unit in text.encode_utf16() {
        dst.put_u16(unit);
    }
    dst.put_u16(TERMINATOR);
}

impl Decoder for IdentifyCodec {
    type Item = Identification;
    type Error = IdentifyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let marker = (&src[..4]).get_i32();
        if marker != IDENTIFY_MARKER {
            return Err(IdentifyError::BadMarker(marker));
        }

        let mut offset = 4;
        let Some((name, used)) = scan_field(&src[offset..], self.max_name_len, "name")? else {
            return Ok(None);
        };
        offset += used;
        let Some((password, used)) =
            scan_field(&src[offset..], self.max_password_len, "password")?
        else {
            return Ok(None);
        };
        offset += used;

        let name =
            String::from_utf16(&name).map_err(|_| IdentifyError::InvalidText { field: "name" })?;
        let password = String::from_utf16(&password)
            .map_err(|_| IdentifyError::InvalidText { field: "password" })?;

        src.advance(offset);
        Ok(Some(Identification { name, password }))
    }
}

impl Encoder<RouteReply> for IdentifyCodec {
    type Error = IdentifyError;

    fn encode(&mut self, item: RouteReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RouteReply::Fail => dst.put_i32(FAIL_MARKER),
            RouteReply::Info(ip) => {
                dst.put_i32(INFO_MARKER);
                put_utf16_line(dst, &ip);
            }
        }
        Ok(())
    }
}
