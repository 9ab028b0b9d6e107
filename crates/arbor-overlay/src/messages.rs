/// Messages the overlay itself puts on the wire.
use arbor_transport::{Message, MessageTypeId};
use serde::{Deserialize, Serialize};

use crate::{OverlayError, Roster, ServiceId, Token, TreeId, TreeMarshal, TreeNodeId};

/// A protocol message addressed to one tree node.
///
/// `data` is the MessagePack encoding of the inner message, whose type is
/// `msg_type`; the receiver decodes it with its own registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProtocolMsg {
    pub token: Token,
    pub from: TreeNodeId,
    pub msg_type: MessageTypeId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Message for ProtocolMsg {
    const NAME: &'static str = "arbor.overlay.ProtocolMsg";
}

/// Ask the sender of a message for a tree we do not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RequestTree {
    pub tree_id: TreeId,
}

impl Message for RequestTree {
    const NAME: &'static str = "arbor.overlay.RequestTree";
}

/// Answer to [`RequestTree`]: the tree together with its roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SendTree {
    pub roster: Roster,
    pub tree: TreeMarshal,
}

impl Message for SendTree {
    const NAME: &'static str = "arbor.overlay.SendTree";
}

/// A request from an external client to a named service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub service: ServiceId,
    pub msg_type: MessageTypeId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Message for ClientRequest {
    const NAME: &'static str = "arbor.overlay.ClientRequest";
}

impl ClientRequest {
    /// Wrap `msg` for the service registered as `service`.
    pub fn new<M: Message>(service: &str, msg: &M) -> Result<Self, OverlayError> {
        Ok(Self {
            service: ServiceId::from_name(service),
            msg_type: MessageTypeId::of::<M>(),
            data: rmp_serde::to_vec(msg)?,
        })
    }
}

/// Error reply to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRet {
    pub error: String,
}

impl Message for StatusRet {
    const NAME: &'static str = "arbor.overlay.StatusRet";
}
