/// Token-keyed bookkeeping of one host: known trees and rosters, live
/// protocol instances, finished tokens and messages waiting for a tree we
/// have not received yet.
///
/// Finished tokens are kept per tree for the life of the host, so a late
/// message can never start a second instance for the same token. Parked
/// messages are bounded twice: per tree and in the number of unknown trees,
/// and a tree that does not show up within `park_timeout` is given up.
///
/// All state sits behind one mutex that is never held across an await.
/// Instances are created lazily, on the first message for their token,
/// and the slot is reserved under that mutex, so a token maps to at most
/// one instance.
use arbor_transport::{MessageRegistry, ServerId, ServerIdentity};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::host::HostInner;
use crate::messages::ProtocolMsg;
use crate::{
    HostConfig, OverlayError, ProtocolId, RoundId, Roster, RosterId, ServiceId, Token, Tree, TreeId, TreeNode,
    TreeNodeInstance,
};

pub(crate) type Parked = (ServerIdentity, ProtocolMsg);

/// What to do with an incoming protocol message.
pub(crate) enum Resolution {
    Drop(&'static str),
    /// Tree unknown; the message is kept until it arrives. `request` is
    /// set the first time, when the tree should be asked for.
    Park { request: bool },
    Deliver {
        node: TreeNodeInstance,
        from: TreeNode,
        created: bool,
    },
}

/// Messages for one unknown tree. `since` is when the first one arrived.
struct Waiting {
    since: Instant,
    parked: Vec<Parked>,
}

struct State {
    trees: HashMap<TreeId, Arc<Tree>>,
    rosters: HashMap<RosterId, Arc<Roster>>,
    instances: HashMap<Token, TreeNodeInstance>,
    finished: HashMap<TreeId, HashSet<Token>>,
    /// Oldest unknown tree first; entries are never promoted.
    pending: LruCache<TreeId, Waiting>,
    closed: bool,
}

impl State {
    fn is_finished(&self, token: &Token) -> bool {
        self.finished
            .get(&token.tree_id)
            .is_some_and(|tokens| tokens.contains(token))
    }

    fn expire_pending(&mut self, timeout: Duration) {
        loop {
            let expired = self
                .pending
                .peek_lru()
                .is_some_and(|(_, waiting)| waiting.since.elapsed() >= timeout);
            if !expired {
                break;
            }
            if let Some((tree_id, waiting)) = self.pending.pop_lru() {
                tracing::debug!(
                    "tree {tree_id} never arrived, dropping {} parked messages",
                    waiting.parked.len()
                );
            }
        }
    }
}

pub(crate) struct Overlay {
    local: ServerId,
    messages: Arc<MessageRegistry>,
    capacity: usize,
    park_timeout: Duration,
    state: Mutex<State>,
}

/// Parked messages kept per unknown tree.
const MAX_PARKED: usize = 1024;

impl Overlay {
    pub(crate) fn new(local: ServerId, messages: Arc<MessageRegistry>, config: &HostConfig) -> Self {
        let pending_trees = NonZeroUsize::new(config.pending_trees).unwrap_or(NonZeroUsize::MIN);
        Self {
            local,
            messages,
            capacity: config.mailbox_capacity,
            park_timeout: config.park_timeout,
            state: Mutex::new(State {
                trees: HashMap::new(),
                rosters: HashMap::new(),
                instances: HashMap::new(),
                finished: HashMap::new(),
                pending: LruCache::new(pending_trees),
                closed: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Trees and rosters ─────────────────────────────────────────────

    pub(crate) fn register_roster(&self, roster: Arc<Roster>) {
        self.state().rosters.entry(roster.id()).or_insert(roster);
    }

    /// Store `tree` and its roster. Returns the messages that were parked
    /// waiting for it.
    pub(crate) fn register_tree(&self, tree: Arc<Tree>) -> Vec<Parked> {
        let mut state = self.state();
        let roster = tree.roster().clone();
        state.rosters.entry(roster.id()).or_insert(roster);
        let parked = state
            .pending
            .pop(&tree.id())
            .map(|waiting| waiting.parked)
            .unwrap_or_default();
        state.trees.entry(tree.id()).or_insert(tree);
        parked
    }

    pub(crate) fn tree(&self, id: &TreeId) -> Option<Arc<Tree>> {
        self.state().trees.get(id).cloned()
    }

    pub(crate) fn roster(&self, id: &RosterId) -> Option<Arc<Roster>> {
        self.state().rosters.get(id).cloned()
    }

    // ── Instances ─────────────────────────────────────────────────────

    /// Reserve a fresh token for a locally initiated run on `tree`.
    ///
    /// The instance sits on the root if this server holds it, otherwise
    /// on the first node this server holds.
    pub(crate) fn new_node(
        &self,
        host: Weak<HostInner>,
        tree: Arc<Tree>,
        proto_id: ProtocolId,
        service_id: Option<ServiceId>,
    ) -> Result<TreeNodeInstance, OverlayError> {
        let node = if tree.root().server_identity().id() == self.local {
            tree.root()
        } else {
            tree.nodes_for(&self.local)
                .into_iter()
                .next()
                .ok_or(OverlayError::NotInTree(tree.id()))?
        };
        let position = tree
            .position(&node.id())
            .ok_or(OverlayError::UnknownTreeNode(node.id()))?;
        let token = Token {
            roster_id: tree.roster().id(),
            tree_id: tree.id(),
            proto_id,
            service_id,
            round_id: RoundId::new(),
            tree_node_id: node.id(),
        };

        let mut state = self.state();
        if state.closed {
            return Err(OverlayError::HostClosed);
        }
        state.trees.entry(tree.id()).or_insert_with(|| tree.clone());
        let instance = TreeNodeInstance::new(
            token,
            tree,
            position,
            host,
            self.messages.clone(),
            self.capacity,
        );
        state.instances.insert(token, instance.clone());
        Ok(instance)
    }

    pub(crate) fn node(&self, token: &Token) -> Option<TreeNodeInstance> {
        self.state().instances.get(token).cloned()
    }

    /// Attach the protocol instance for `token`. Fails with `AlreadyBound`
    /// if it is attached already or has finished.
    pub(crate) fn bind(&self, token: &Token) -> Result<(), OverlayError> {
        let node = {
            let state = self.state();
            if state.is_finished(token) {
                return Err(OverlayError::AlreadyBound(*token));
            }
            state
                .instances
                .get(token)
                .cloned()
                .ok_or(OverlayError::UnknownInstance(*token))?
        };
        if node.bind() {
            Ok(())
        } else {
            Err(OverlayError::AlreadyBound(*token))
        }
    }

    /// Forget `token`'s instance and remember that it finished.
    pub(crate) fn finish(&self, token: &Token) {
        let mut state = self.state();
        state.instances.remove(token);
        state.finished.entry(token.tree_id).or_default().insert(*token);
    }

    /// Drop an instance that never got to run.
    pub(crate) fn discard(&self, token: &Token) {
        let removed = self.state().instances.remove(token);
        if let Some(node) = removed {
            node.discard();
        }
    }

    /// Refuse new instances and finish the live ones.
    pub(crate) fn close_all(&self) {
        let live: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            state.pending.clear();
            state.instances.drain().map(|(_, n)| n).collect()
        };
        for node in live {
            node.done();
        }
    }

    pub(crate) fn is_finished(&self, token: &Token) -> bool {
        self.state().is_finished(token)
    }

    #[cfg(test)]
    fn pending_trees(&self) -> usize {
        self.state().pending.len()
    }

    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let state = self.state();
        (state.instances.len(), state.trees.len(), state.rosters.len())
    }

    // ── Incoming ──────────────────────────────────────────────────────

    /// Find, or reserve, the instance `pm` is addressed to.
    pub(crate) fn resolve(
        &self,
        host: &Weak<HostInner>,
        from: &ServerIdentity,
        pm: &ProtocolMsg,
    ) -> Resolution {
        let mut state = self.state();
        if state.closed {
            return Resolution::Drop("host is closing");
        }
        if state.is_finished(&pm.token) {
            return Resolution::Drop("instance already finished");
        }

        if let Some(node) = state.instances.get(&pm.token) {
            return match sender_node(node.tree(), from, pm) {
                Ok(sender) => Resolution::Deliver {
                    node: node.clone(),
                    from: sender,
                    created: false,
                },
                Err(reason) => Resolution::Drop(reason),
            };
        }

        let Some(tree) = state.trees.get(&pm.token.tree_id).cloned() else {
            return self.park(&mut state, from, pm);
        };

        let Some(position) = tree.position(&pm.token.tree_node_id) else {
            return Resolution::Drop("unknown tree node");
        };
        if tree.node_at(position).server_identity().id() != self.local {
            return Resolution::Drop("tree node is not on this server");
        }
        let sender = match sender_node(&tree, from, pm) {
            Ok(sender) => sender,
            Err(reason) => return Resolution::Drop(reason),
        };

        let node = TreeNodeInstance::new(
            pm.token,
            tree,
            position,
            host.clone(),
            self.messages.clone(),
            self.capacity,
        );
        state.instances.insert(pm.token, node.clone());
        Resolution::Deliver {
            node,
            from: sender,
            created: true,
        }
    }

    fn park(&self, state: &mut State, from: &ServerIdentity, pm: &ProtocolMsg) -> Resolution {
        state.expire_pending(self.park_timeout);
        if let Some(waiting) = state.pending.peek_mut(&pm.token.tree_id) {
            if waiting.parked.len() >= MAX_PARKED {
                return Resolution::Drop("too many messages for unknown tree");
            }
            waiting.parked.push((from.clone(), pm.clone()));
            return Resolution::Park { request: false };
        }
        if state.pending.len() >= state.pending.cap().get() {
            return Resolution::Drop("too many unknown trees");
        }
        state.pending.put(
            pm.token.tree_id,
            Waiting {
                since: Instant::now(),
                parked: vec![(from.clone(), pm.clone())],
            },
        );
        Resolution::Park { request: true }
    }
}

/// The tree node `pm` claims to come from, if the authenticated sender
/// actually holds it.
fn sender_node(tree: &Tree, from: &ServerIdentity, pm: &ProtocolMsg) -> Result<TreeNode, &'static str> {
    let node = tree.search(&pm.from).ok_or("unknown sender node")?;
    if node.server_identity().id() != from.id() {
        return Err("sender does not hold the node it claims");
    }
    Ok(node.clone())
}
