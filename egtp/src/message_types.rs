use crate::conversation::Outcome;
use crate::handicapper::Handicapper;
use crate::handlers::{MessageHandler, Responder};
use crate::hints::CommHints;
use crate::identity::PeerId;
use crate::pool::ConnId;
use crate::strategy::{AddressRecord, StrategyError};
use futures::channel::oneshot;
use serde_json::Value;
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Per-send options. The defaults use the learned timeout and no extra hints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Overrides the timeout learned from earlier round trips.
    pub timeout: Option<Duration>,
    pub hints: CommHints,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        SendOptions { timeout: Some(timeout), ..Default::default() }
    }
}

/// A snapshot of the node's state, for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub connections: usize,
    pub known_strategies: usize,
    pub conversations: usize,
    pub preferred_relayers: Vec<PeerId>,
    pub listen_addr: Option<SocketAddr>,
}

/// Commands sent from a [`crate::Client`] to the event loop. Every command that produces a result carries the
/// sender half of a oneshot channel for it.
pub enum Command {
    Send {
        recipient: PeerId,
        message_type: String,
        body: Option<Value>,
        options: SendOptions,
        outcome: oneshot::Sender<Outcome>,
        late: Option<oneshot::Sender<Outcome>>,
    },
    RegisterHandler {
        message_type: String,
        handler: Box<dyn MessageHandler>,
        sender: oneshot::Sender<()>,
    },
    UnregisterHandler {
        message_type: String,
        sender: oneshot::Sender<bool>,
    },
    Respond {
        responder: Responder,
        body: Option<Value>,
        failure: Option<String>,
        hints: CommHints,
        sender: oneshot::Sender<bool>,
    },
    UseAddress {
        record: AddressRecord,
        sender: oneshot::Sender<Result<PeerId, StrategyError>>,
    },
    AddHandicapper {
        handicapper: Box<dyn Handicapper>,
        sender: oneshot::Sender<()>,
    },
    OwnAddress {
        sender: oneshot::Sender<Option<AddressRecord>>,
    },
    Stats {
        sender: oneshot::Sender<NodeStats>,
    },
    Shutdown {
        sender: oneshot::Sender<()>,
    },
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send { recipient, message_type, .. } => write!(f, "Send '{message_type}' to {recipient}"),
            Command::RegisterHandler { message_type, .. } => write!(f, "RegisterHandler '{message_type}'"),
            Command::UnregisterHandler { message_type, .. } => write!(f, "UnregisterHandler '{message_type}'"),
            Command::Respond { responder, failure: None, .. } => write!(f, "Respond to {responder}"),
            Command::Respond { responder, failure: Some(reason), .. } => {
                write!(f, "Respond to {responder} with failure '{reason}'")
            }
            Command::UseAddress { .. } => write!(f, "UseAddress"),
            Command::AddHandicapper { .. } => write!(f, "AddHandicapper"),
            Command::OwnAddress { .. } => write!(f, "OwnAddress"),
            Command::Stats { .. } => write!(f, "Stats"),
            Command::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

/// What the socket tasks report to the event loop.
pub enum IoEvent {
    Accepted { stream: TcpStream, remote: SocketAddr },
    Connected { conn: ConnId, stream: TcpStream },
    ConnectFailed { conn: ConnId, reason: String },
    Received { conn: ConnId, bytes: Vec<u8> },
    Written { conn: ConnId, n: usize },
    Closed { conn: ConnId, reason: String },
    /// A message we sent to ourselves.
    Loopback { plaintext: Vec<u8> },
}

impl Debug for IoEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IoEvent::Accepted { remote, .. } => write!(f, "Accepted({remote})"),
            IoEvent::Connected { conn, .. } => write!(f, "Connected(#{conn})"),
            IoEvent::ConnectFailed { conn, reason } => write!(f, "ConnectFailed(#{conn}, {reason})"),
            IoEvent::Received { conn, bytes } => write!(f, "Received(#{conn}, {} bytes)", bytes.len()),
            IoEvent::Written { conn, n } => write!(f, "Written(#{conn}, {n} bytes)"),
            IoEvent::Closed { conn, reason } => write!(f, "Closed(#{conn}, {reason})"),
            IoEvent::Loopback { plaintext } => write!(f, "Loopback({} bytes)", plaintext.len()),
        }
    }
}
