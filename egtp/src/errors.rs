use futures::channel::{mpsc, oneshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures to move bytes to or from a counterparty. A transport failure on a send makes the node forget the comm
/// strategy it used and retry once through address re-resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Message of {size} bytes exceeds the maximum message size of {max} bytes.")]
    MessageTooLarge { size: usize, max: usize },
    #[error("The connection was closed. {0}")]
    ConnectionClosed(String),
    #[error("I/O error. {0}")]
    Io(String),
    #[error("Could not connect to {0}.")]
    ConnectFailed(String),
    #[error("Too many busy connections.")]
    TooManyBusyConnections,
    #[error("No usable comm strategy. {0}")]
    NoStrategy(String),
    #[error("The relay did not accept the message. {0}")]
    RelayFailed(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// The structured reason a conversation ended without a response. This is what callers of
/// [`crate::Client::send`] see; it never carries internal state.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationFailure {
    #[error("The conversation timed out.")]
    Timeout,
    #[error("The message could not be delivered. {0}")]
    Transport(String),
    #[error("The counterparty reported a failure. {0}")]
    Remote(String),
    #[error("No address is known for the counterparty.")]
    NoAddress,
    #[error("The node is shutting down.")]
    Shutdown,
}

impl From<TransportError> for ConversationFailure {
    fn from(err: TransportError) -> Self {
        ConversationFailure::Transport(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("The event loop is no longer running.")]
    EventLoopGone,
    #[error("The conversation failed. {0}")]
    Conversation(#[from] ConversationFailure),
    #[error("Could not start listening. {0}")]
    Listen(String),
    #[error("Invalid address record. {0}")]
    InvalidAddress(#[from] crate::strategy::StrategyError),
    #[error("Unknown responder. The request has already been answered or has expired.")]
    UnknownResponder,
}

impl From<mpsc::SendError> for ClientError {
    fn from(_: mpsc::SendError) -> Self {
        ClientError::EventLoopGone
    }
}

impl From<oneshot::Canceled> for ClientError {
    fn from(_: oneshot::Canceled) -> Self {
        ClientError::EventLoopGone
    }
}
