use arbor_transport::{PublicKey, ServerId, ServerIdentity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::{OverlayError, Tree};

/// Identifier of a roster: SHA-256 over the ordered server ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RosterId([u8; 32]);

impl RosterId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RosterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RosterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RosterId({}...)", &hex::encode(self.0)[..12])
    }
}

/// Ordered list of the servers taking part in a run.
///
/// The same identity may appear several times; the id covers the order,
/// so two rosters with the same members in a different order differ.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RosterWire", into = "RosterWire")]
pub struct Roster {
    id: RosterId,
    list: Vec<ServerIdentity>,
}

#[derive(Serialize, Deserialize)]
struct RosterWire {
    list: Vec<ServerIdentity>,
}

impl From<RosterWire> for Roster {
    fn from(wire: RosterWire) -> Self {
        Roster::new(wire.list)
    }
}

impl From<Roster> for RosterWire {
    fn from(roster: Roster) -> Self {
        RosterWire { list: roster.list }
    }
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        let mut hasher = Sha256::new();
        for si in &list {
            hasher.update(si.id().as_bytes());
        }
        Self {
            id: RosterId(hasher.finalize().into()),
            list,
        }
    }

    pub fn id(&self) -> RosterId {
        self.id
    }

    pub fn list(&self) -> &[ServerIdentity] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ServerIdentity> {
        self.list.get(index)
    }

    /// First position of `id` in the roster.
    pub fn search(&self, id: &ServerId) -> Option<(usize, &ServerIdentity)> {
        self.list.iter().enumerate().find(|(_, si)| si.id() == *id)
    }

    /// Public keys in roster order.
    pub fn publics(&self) -> Vec<PublicKey> {
        self.list.iter().map(|si| *si.public()).collect()
    }

    /// Breadth-first tree of `size` nodes with at most `branching` children
    /// per node.
    ///
    /// Node `i` is owned by roster entry `i % len`, so a `size` larger than
    /// the roster reuses entries round-robin.
    pub fn generate_tree(self: &Arc<Self>, branching: usize, size: usize) -> Result<Tree, OverlayError> {
        if self.is_empty() {
            return Err(OverlayError::InvalidTree("empty roster".into()));
        }
        let order: Vec<usize> = (0..size).map(|i| i % self.len()).collect();
        Tree::build(Arc::clone(self), &order, branching)
    }

    /// `n`-ary tree over every roster entry, rooted at the first one.
    pub fn generate_nary_tree(self: &Arc<Self>, n: usize) -> Result<Tree, OverlayError> {
        self.generate_tree(n, self.len())
    }

    pub fn generate_binary_tree(self: &Arc<Self>) -> Result<Tree, OverlayError> {
        self.generate_nary_tree(2)
    }

    /// `n`-ary tree rooted at `root`; the other entries follow in roster
    /// order.
    pub fn generate_nary_tree_with_root(
        self: &Arc<Self>,
        n: usize,
        root: &ServerIdentity,
    ) -> Result<Tree, OverlayError> {
        let (root_index, _) = self
            .search(&root.id())
            .ok_or_else(|| OverlayError::InvalidTree(format!("{root} is not in the roster")))?;
        let order: Vec<usize> = std::iter::once(root_index)
            .chain((0..self.len()).filter(|&i| i != root_index))
            .collect();
        Tree::build(Arc::clone(self), &order, n)
    }
}

impl fmt::Debug for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Roster")
            .field("id", &self.id)
            .field("len", &self.list.len())
            .finish()
    }
}

impl fmt::Display for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, si) in self.list.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{si}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_transport::Keypair;

    fn identities(n: u8) -> Vec<ServerIdentity> {
        (0..n)
            .map(|i| {
                ServerIdentity::new(
                    Keypair::from_seed(&[i; 32]).public(),
                    vec![format!("127.0.0.1:{}", 7000 + i as u16)],
                )
            })
            .collect()
    }

    #[test]
    fn id_depends_on_order() {
        let mut list = identities(3);
        let a = Roster::new(list.clone());
        list.swap(0, 2);
        let b = Roster::new(list);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), Roster::new(identities(3)).id());
    }

    #[test]
    fn search_and_publics() {
        let list = identities(4);
        let roster = Roster::new(list.clone());
        let (i, si) = roster.search(&list[2].id()).unwrap();
        assert_eq!(i, 2);
        assert_eq!(si, &list[2]);
        assert_eq!(roster.publics()[3], *list[3].public());

        let stranger = identities(5).pop().unwrap();
        assert!(roster.search(&stranger.id()).is_none());
    }

    #[test]
    fn serde_roundtrip_keeps_id() {
        let roster = Roster::new(identities(3));
        let bytes = rmp_serde::to_vec(&roster).unwrap();
        let back: Roster = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.id(), roster.id());
        assert_eq!(back, roster);
    }

    #[test]
    fn tree_with_chosen_root() {
        let list = identities(5);
        let roster = Arc::new(Roster::new(list.clone()));
        let tree = roster.generate_nary_tree_with_root(2, &list[3]).unwrap();
        assert_eq!(tree.root().server_identity().id(), list[3].id());
        assert_eq!(tree.size(), 5);
        assert!(tree.uses_roster_fully());
    }

    #[test]
    fn empty_roster_has_no_tree() {
        let roster = Arc::new(Roster::new(vec![]));
        assert!(matches!(
            roster.generate_binary_tree(),
            Err(OverlayError::InvalidTree(_))
        ));
    }
}
