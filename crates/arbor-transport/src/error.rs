use crate::{MessageTypeId, ServerId};

/// Errors returned by the arbor transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server {0:?} has no address to dial")]
    NoAddress(ServerId),

    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(MessageTypeId),

    #[error("message name {name} is registered for another type")]
    DuplicateRegistration { name: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("listener already started")]
    AlreadyListening,

    #[error("connection closed")]
    Closed,

    /// Returned when closing something that is already closed.
    /// Callers can usually treat it as success.
    #[error("already closed")]
    AlreadyClosed,
}

impl TransportError {
    /// True for the conditions a closed connection or host produces.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::AlreadyClosed)
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_too_large() {
        let err = TransportError::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "message too large: 10 bytes (max 4)");
    }

    #[test]
    fn closed_sentinels() {
        assert!(TransportError::AlreadyClosed.is_closed());
        assert!(TransportError::Closed.is_closed());
        assert!(!TransportError::InvalidSignature.is_closed());
    }
}
