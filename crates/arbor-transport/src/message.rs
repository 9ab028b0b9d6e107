/// Typed messages and the registry that maps wire type ids back to them.
///
/// Every message type that crosses a connection must be registered on
/// both ends before traffic flows. The type id is derived from the
/// message's stable name, so sender and receiver agree on it without
/// negotiation.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::{ServerIdentity, TransportError};

/// A message that can be sent over a [`SecureConn`](crate::SecureConn).
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Stable wire name. Two types with the same name cannot be
    /// registered in the same registry.
    const NAME: &'static str;
}

/// Wire identifier of a message type: first 16 bytes of SHA-256(name).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageTypeId([u8; 16]);

impl MessageTypeId {
    pub fn of<M: Message>() -> Self {
        Self::from_name(M::NAME)
    }

    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageTypeId({})", &hex::encode(self.0)[..8])
    }
}

/// A decoded message whose concrete type is only known through its
/// [`MessageTypeId`].
pub type AnyMessage = Box<dyn Any + Send>;

type DecodeFn = fn(&[u8]) -> Result<AnyMessage, rmp_serde::decode::Error>;

fn decode_as<M: Message>(data: &[u8]) -> Result<AnyMessage, rmp_serde::decode::Error> {
    Ok(Box::new(rmp_serde::from_slice::<M>(data)?))
}

#[derive(Clone)]
struct Entry {
    name: &'static str,
    rust_type: TypeId,
    decode: DecodeFn,
}

/// Table of known message types.
///
/// Built once before hosts start and then shared read-only, so several
/// isolated registries can coexist in one process.
#[derive(Default, Clone)]
pub struct MessageRegistry {
    entries: HashMap<MessageTypeId, Entry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M`. Registering the same type again is a no-op.
    pub fn register<M: Message>(&mut self) -> Result<MessageTypeId, TransportError> {
        let id = MessageTypeId::of::<M>();
        match self.entries.get(&id) {
            Some(entry) if entry.rust_type == TypeId::of::<M>() => Ok(id),
            Some(entry) => Err(TransportError::DuplicateRegistration {
                name: entry.name.to_string(),
            }),
            None => {
                self.entries.insert(
                    id,
                    Entry {
                        name: M::NAME,
                        rust_type: TypeId::of::<M>(),
                        decode: decode_as::<M>,
                    },
                );
                Ok(id)
            }
        }
    }

    pub fn is_registered(&self, id: &MessageTypeId) -> bool {
        self.entries.contains_key(id)
    }

    /// Name a type id was registered under.
    pub fn name(&self, id: &MessageTypeId) -> Option<&'static str> {
        self.entries.get(id).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize a registered message to MessagePack.
    pub fn encode<M: Message>(&self, msg: &M) -> Result<(MessageTypeId, Vec<u8>), TransportError> {
        let id = MessageTypeId::of::<M>();
        if !self.is_registered(&id) {
            return Err(TransportError::UnknownMessageType(id));
        }
        Ok((id, rmp_serde::to_vec(msg)?))
    }

    /// Decode `data` into the concrete type registered under `id`.
    pub fn decode(&self, id: &MessageTypeId, data: &[u8]) -> Result<AnyMessage, TransportError> {
        let entry = self
            .entries
            .get(id)
            .ok_or(TransportError::UnknownMessageType(*id))?;
        (entry.decode)(data).map_err(Into::into)
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("types", &names)
            .finish()
    }
}

/// A message received from a connection.
pub struct Packet {
    /// Authenticated sender.
    pub from: ServerIdentity,
    pub msg_type: MessageTypeId,
    pub msg: AnyMessage,
}

impl Packet {
    pub fn is<M: Message>(&self) -> bool {
        self.msg.is::<M>()
    }

    pub fn msg_ref<M: Message>(&self) -> Option<&M> {
        self.msg.downcast_ref::<M>()
    }

    /// Take the typed message out, or give the packet back on mismatch.
    pub fn downcast<M: Message>(self) -> Result<(ServerIdentity, M), Packet> {
        let Packet { from, msg_type, msg } = self;
        match msg.downcast::<M>() {
            Ok(m) => Ok((from, *m)),
            Err(msg) => Err(Packet { from, msg_type, msg }),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("from", &self.from)
            .field("msg_type", &self.msg_type)
            .finish_non_exhaustive()
    }
}
