/// Spanning trees over a roster.
///
/// Nodes are stored in breadth-first order in one arena; parent and child
/// links are node ids. A node id hashes the parent id, the owning server
/// and the position among its siblings, so ids stay unique when one
/// server owns several nodes. The tree id hashes the roster id and all
/// node ids, which lets independent servers derive the same id for the
/// same topology.
use arbor_transport::{ServerId, ServerIdentity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{OverlayError, Roster, RosterId};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeId([u8; 32]);

impl TreeId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeId({}...)", &hex::encode(self.0)[..12])
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeNodeId([u8; 32]);

impl TreeNodeId {
    fn derive(parent: Option<&TreeNodeId>, server: &ServerId, position: u32) -> Self {
        let mut hasher = Sha256::new();
        match parent {
            Some(p) => hasher.update(p.0),
            None => hasher.update([0u8; 32]),
        }
        hasher.update(server.as_bytes());
        hasher.update(position.to_be_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl fmt::Debug for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeNodeId({}...)", &hex::encode(self.0)[..12])
    }
}

/// One position in a [`Tree`].
#[derive(Clone, PartialEq, Eq)]
pub struct TreeNode {
    id: TreeNodeId,
    server_identity: ServerIdentity,
    roster_index: usize,
    parent: Option<TreeNodeId>,
    children: Vec<TreeNodeId>,
}

impl TreeNode {
    pub fn id(&self) -> TreeNodeId {
        self.id
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        &self.server_identity
    }

    /// Index of the owning server in the tree's roster.
    pub fn roster_index(&self) -> usize {
        self.roster_index
    }

    pub fn parent(&self) -> Option<TreeNodeId> {
        self.parent
    }

    /// Child ids in tree order.
    pub fn children(&self) -> &[TreeNodeId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("id", &self.id)
            .field("server", &self.server_identity.to_string())
            .field("children", &self.children.len())
            .finish()
    }
}

/// Immutable rooted tree over a roster. Cheap to share behind an `Arc`.
pub struct Tree {
    id: TreeId,
    roster: Arc<Roster>,
    branching: usize,
    nodes: Vec<TreeNode>,
    index: HashMap<TreeNodeId, usize>,
}

// ── Construction ──────────────────────────────────────────────────────

impl Tree {
    /// Breadth-first tree whose `i`-th node is owned by roster entry
    /// `order[i]`.
    pub(crate) fn build(
        roster: Arc<Roster>,
        order: &[usize],
        branching: usize,
    ) -> Result<Tree, OverlayError> {
        if branching == 0 {
            return Err(OverlayError::InvalidTree(
                "branching factor must be at least 1".into(),
            ));
        }
        let parents = (0..order.len()).map(|i| if i == 0 { None } else { Some((i - 1) / branching) });
        let layout: Vec<(usize, Option<usize>)> = order.iter().copied().zip(parents).collect();
        Self::assemble(roster, branching, &layout)
    }

    /// Build nodes from `(roster index, parent position)` pairs listed so
    /// that every parent precedes its children.
    fn assemble(
        roster: Arc<Roster>,
        branching: usize,
        layout: &[(usize, Option<usize>)],
    ) -> Result<Tree, OverlayError> {
        if layout.is_empty() {
            return Err(OverlayError::InvalidTree("tree has no nodes".into()));
        }
        let mut nodes: Vec<TreeNode> = Vec::with_capacity(layout.len());
        for (i, &(roster_index, parent)) in layout.iter().enumerate() {
            let server_identity = roster
                .get(roster_index)
                .ok_or_else(|| {
                    OverlayError::InvalidTree(format!("roster index {roster_index} out of range"))
                })?
                .clone();
            let (parent_id, position) = match parent {
                None if i == 0 => (None, 0),
                Some(p) if p < i => (Some(nodes[p].id), nodes[p].children.len() as u32),
                _ => {
                    return Err(OverlayError::InvalidTree(format!(
                        "node {i} has an invalid parent"
                    )))
                }
            };
            let id = TreeNodeId::derive(parent_id.as_ref(), &server_identity.id(), position);
            if let Some(p) = parent {
                nodes[p].children.push(id);
            }
            nodes.push(TreeNode {
                id,
                server_identity,
                roster_index,
                parent: parent_id,
                children: Vec::new(),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(roster.id().as_bytes());
        for node in &nodes {
            hasher.update(node.id.0);
        }
        let index = nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        Ok(Tree {
            id: TreeId(hasher.finalize().into()),
            roster,
            branching,
            nodes,
            index,
        })
    }
}

// ── Queries ───────────────────────────────────────────────────────────

impl Tree {
    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// Branching factor the tree was built with.
    pub fn branching_factor(&self) -> usize {
        self.branching
    }

    pub fn root(&self) -> &TreeNode {
        // `assemble` rejects empty trees.
        &self.nodes[0]
    }

    /// All nodes in breadth-first order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn search(&self, id: &TreeNodeId) -> Option<&TreeNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn position(&self, id: &TreeNodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn node_at(&self, position: usize) -> &TreeNode {
        &self.nodes[position]
    }

    pub fn parent_of(&self, id: &TreeNodeId) -> Option<&TreeNode> {
        self.search(id)?.parent.as_ref().and_then(|p| self.search(p))
    }

    pub fn children_of(&self, id: &TreeNodeId) -> Vec<&TreeNode> {
        match self.search(id) {
            Some(node) => node.children.iter().filter_map(|c| self.search(c)).collect(),
            None => Vec::new(),
        }
    }

    /// Every node owned by `server`, in breadth-first order.
    pub fn nodes_for(&self, server: &ServerId) -> Vec<&TreeNode> {
        self.nodes
            .iter()
            .filter(|n| n.server_identity.id() == *server)
            .collect()
    }

    /// Number of edges between the root and the deepest leaf.
    pub fn depth(&self) -> usize {
        let mut depths = vec![0usize; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate().skip(1) {
            if let Some(p) = node.parent.as_ref().and_then(|p| self.position(p)) {
                depths[i] = depths[p] + 1;
            }
        }
        depths.into_iter().max().unwrap_or(0)
    }

    /// Edges between the root and `id`.
    pub fn depth_of(&self, id: &TreeNodeId) -> Option<usize> {
        let mut node = self.search(id)?;
        let mut depth = 0;
        while let Some(parent) = node.parent.as_ref().and_then(|p| self.search(p)) {
            node = parent;
            depth += 1;
        }
        Some(depth)
    }

    /// True if the subtree under `id` is a complete `n`-ary tree: no node
    /// has more than `n` children and at most one node has between 1 and
    /// `n - 1`.
    pub fn is_nary(&self, id: &TreeNodeId, n: usize) -> bool {
        let Some(start) = self.search(id) else {
            return false;
        };
        let mut partial = 0;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            let count = node.children.len();
            if count > n {
                return false;
            }
            if count != 0 && count != n {
                partial += 1;
            }
            stack.extend(node.children.iter().filter_map(|c| self.search(c)));
        }
        partial <= 1
    }

    pub fn is_binary(&self, id: &TreeNodeId) -> bool {
        self.is_nary(id, 2)
    }

    /// True if every roster entry owns at least one node.
    pub fn uses_roster_fully(&self) -> bool {
        let mut used = vec![false; self.roster.len()];
        for node in &self.nodes {
            if let Some(slot) = used.get_mut(node.roster_index) {
                *slot = true;
            }
        }
        used.into_iter().all(|u| u)
    }
}

// ── Marshalling ───────────────────────────────────────────────────────

/// Wire form of a [`Tree`]: the roster is sent alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMarshal {
    pub id: TreeId,
    pub roster_id: RosterId,
    pub branching: usize,
    pub nodes: Vec<NodeMarshal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMarshal {
    pub id: TreeNodeId,
    pub roster_index: usize,
    /// Position of the parent in `nodes`.
    pub parent: Option<usize>,
}

impl Tree {
    pub fn marshal(&self) -> TreeMarshal {
        TreeMarshal {
            id: self.id,
            roster_id: self.roster.id(),
            branching: self.branching,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeMarshal {
                    id: n.id,
                    roster_index: n.roster_index,
                    parent: n.parent.as_ref().and_then(|p| self.position(p)),
                })
                .collect(),
        }
    }

    /// Rebuild a tree and check every id against the marshalled ones.
    pub fn from_marshal(m: &TreeMarshal, roster: Arc<Roster>) -> Result<Tree, OverlayError> {
        if m.roster_id != roster.id() {
            return Err(OverlayError::InvalidTree(format!(
                "tree was built on roster {:?}, got {:?}",
                m.roster_id,
                roster.id()
            )));
        }
        let layout: Vec<(usize, Option<usize>)> =
            m.nodes.iter().map(|n| (n.roster_index, n.parent)).collect();
        let tree = Self::assemble(roster, m.branching.max(1), &layout)?;

        let ids_match = tree.nodes.iter().zip(&m.nodes).all(|(n, w)| n.id == w.id);
        if !ids_match || tree.id != m.id {
            return Err(OverlayError::InvalidTree("node ids do not match".into()));
        }
        Ok(tree)
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("size", &self.nodes.len())
            .field("branching", &self.branching)
            .finish()
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(tree: &Tree, node: &TreeNode, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "{:indent$}{} ({})", "", node.server_identity, node.id, indent = depth * 2)?;
            for child in node.children.iter().filter_map(|c| tree.search(c)) {
                walk(tree, child, depth + 1, f)?;
            }
            Ok(())
        }
        walk(self, self.root(), 0, f)
    }
}
