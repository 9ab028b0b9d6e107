use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::{RosterId, TreeId, TreeNodeId};

fn name_hash(name: &str) -> [u8; 16] {
    let digest = Sha256::digest(name.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

/// Identifier of a protocol kind, derived from its registered name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolId([u8; 16]);

impl ProtocolId {
    pub fn from_name(name: &str) -> Self {
        Self(name_hash(name))
    }
}

impl fmt::Debug for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolId({})", &hex::encode(self.0)[..8])
    }
}

/// Identifier of a service, derived from its registered name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId([u8; 16]);

impl ServiceId {
    pub fn from_name(name: &str) -> Self {
        Self(name_hash(name))
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", &hex::encode(self.0)[..8])
    }
}

/// Discriminates runs of the same protocol on the same tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId(Uuid);

impl RoundId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundId({})", self.0)
    }
}

/// Routing key of one protocol instance on one tree node.
///
/// Every host-to-host protocol message carries the token of its target
/// node; the receiving overlay uses it verbatim as the map key of the
/// local instance, so sender and receiver never negotiate it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub roster_id: RosterId,
    pub tree_id: TreeId,
    pub proto_id: ProtocolId,
    pub service_id: Option<ServiceId>,
    pub round_id: RoundId,
    pub tree_node_id: TreeNodeId,
}

impl Token {
    /// Same run, addressed to another node of the tree.
    pub fn with_tree_node(&self, tree_node_id: TreeNodeId) -> Token {
        Token {
            tree_node_id,
            ..*self
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let round = self.round_id.0.simple().to_string();
        write!(f, "{}@{}", &round[..8], self.tree_node_id)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("tree", &self.tree_id)
            .field("proto", &self.proto_id)
            .field("service", &self.service_id)
            .field("round", &self.round_id)
            .field("node", &self.tree_node_id)
            .finish()
    }
}
