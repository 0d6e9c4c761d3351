use std::{borrow::Cow, future::Future, net::SocketAddr};

use thiserror::Error;

use crate::{contact::Contact, Id};

/// The four request kinds of the protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Ping,
    FindNode(Id),
    Store { key: String, value: String },
    FindValue { key: String },
}

/// What a peer answered. `Nodes` doubles as the FIND_VALUE miss arm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Pong,
    Nodes(Vec<Contact>),
    Stored(bool),
    Value(String),
}

/// Object able to deliver a request to a datagram endpoint and await the
/// correlated response. Cloning is cheap; the transport does its own
/// request-id bookkeeping and per-request deadlines.
pub trait RpcSender: Clone + Send {
    /// Future returned when sending a message to another peer
    type Fut: Future<Output = Result<Response, TransportError>> + Send;

    fn send(&self, to: SocketAddr, request: Request) -> Self::Fut;
}

/// Server half: every inbound request is answered from local state.
/// Implemented by the node coordinator; the transport's receive loop is
/// the only caller.
pub trait RequestHandler {
    fn on_request(&self, sender: &Contact, request: Request) -> Response;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("No response before the deadline")]
    Timeout,

    #[error("Peer unreachable")]
    Unreachable,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unknown transport error {0}")]
    UnknownError(Cow<'static, str>),
}

impl From<&'static str> for TransportError {
    fn from(x: &'static str) -> Self {
        TransportError::UnknownError(Cow::Borrowed(x))
    }
}

impl From<String> for TransportError {
    fn from(x: String) -> Self {
        TransportError::UnknownError(Cow::Owned(x))
    }
}
