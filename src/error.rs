use std::net::SocketAddr;
use std::time::Duration;

use crate::ids::Sid;
use crate::protocol::command::Command;
use crate::protocol::status::Status;
use crate::transport::TransportKey;

/// Failures that are surfaced to application code issuing requests, and that are delivered to
///  pending requests when they are torn down. This is `Clone` because a single teardown reason
///  is handed to every request of a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PvaError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connecting to {addr} failed: {reason}")]
    ConnectFailed {
        addr: SocketAddr,
        reason: String,
    },

    #[error("connection to {0} was lost")]
    ConnectionLost(SocketAddr),

    #[error("channel {0:?} is not connected")]
    NotConnected(String),

    #[error("channel was destroyed")]
    ChannelDestroyed,

    #[error("context was destroyed")]
    ContextDestroyed,

    #[error("request was cancelled")]
    Cancelled,

    #[error("a transport is already installed for {0:?}")]
    TransportConflict(TransportKey),

    #[error("identifier {0} is already registered")]
    DuplicateId(u32),

    #[error("no free identifier left")]
    IdsExhausted,

    #[error("a get-field request is already in progress on channel {0}")]
    GetFieldInProgress(Sid),

    #[error("{0:?} is not a command for channel requests")]
    NotARequest(Command),

    #[error("server reported failure: {0}")]
    Remote(Status),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("framing violation: {0}")]
    Framing(String),
}
