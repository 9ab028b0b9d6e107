use arbor_transport::TransportError;

use crate::{Token, TreeId, TreeNodeId};

/// Overlay-level errors.
///
/// Wraps transport errors and adds the routing, registration and
/// lifecycle conditions of the overlay.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("unknown tree {0:?}")]
    UnknownTree(TreeId),

    #[error("unknown tree node {0:?}")]
    UnknownTreeNode(TreeNodeId),

    #[error("this server is not part of tree {0:?}")]
    NotInTree(TreeId),

    #[error("no instance for token {0}")]
    UnknownInstance(Token),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// A protocol instance is already bound to this token, or was and
    /// has finished.
    #[error("token {0} is already bound to a protocol instance")]
    AlreadyBound(Token),

    #[error("{what} is already registered")]
    DuplicateRegistration { what: String },

    #[error("message type {0} is not registered")]
    UnregisteredMessage(String),

    #[error("instance has no route for message {0}")]
    NoRoute(String),

    #[error("mailbox for {0} is full, message rejected")]
    MailboxFull(String),

    #[error("handler registered for a different protocol type")]
    HandlerMismatch,

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("instance already finished")]
    InstanceClosed,

    #[error("host closed")]
    HostClosed,

    /// Error reported by a remote service in reply to a request.
    #[error("remote error: {0}")]
    Status(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for OverlayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        OverlayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for OverlayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        OverlayError::Deserialization(e.to_string())
    }
}
