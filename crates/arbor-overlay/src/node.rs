use arbor_transport::{AnyMessage, Message, MessageRegistry, MessageTypeId, ServerIdentity};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

use crate::dispatch::{Flag, HandlerQueues, Route, Router};
use crate::host::HostInner;
use crate::messages::ProtocolMsg;
use crate::{
    Handle, HandleAll, Host, Incoming, Mailbox, OverlayError, Roster, Token, Tree, TreeNode,
};

pub(crate) struct NodeShared {
    token: Token,
    tree: Arc<Tree>,
    position: usize,
    host: Weak<HostInner>,
    messages: Arc<MessageRegistry>,
    router: Mutex<Router>,
    queues: Mutex<Option<HandlerQueues>>,
    capacity: usize,
    finished: AtomicBool,
}

impl NodeShared {
    fn router(&self) -> MutexGuard<'_, Router> {
        self.router.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle of a protocol instance on its tree node.
///
/// Gives the instance its place in the tree, lets it send to other nodes
/// of the same run and register how incoming messages reach it. Cheap to
/// clone; clones address the same instance.
#[derive(Clone)]
pub struct TreeNodeInstance {
    inner: Arc<NodeShared>,
}

impl TreeNodeInstance {
    pub(crate) fn new(
        token: Token,
        tree: Arc<Tree>,
        position: usize,
        host: Weak<HostInner>,
        messages: Arc<MessageRegistry>,
        capacity: usize,
    ) -> Self {
        let children = tree.node_at(position).children().to_vec();
        let (router, queues) = Router::new(children, capacity);
        Self {
            inner: Arc::new(NodeShared {
                token,
                tree,
                position,
                host,
                messages,
                router: Mutex::new(router),
                queues: Mutex::new(Some(queues)),
                capacity,
                finished: AtomicBool::new(false),
            }),
        }
    }

    // ── Identity and topology ─────────────────────────────────────────

    pub fn token(&self) -> Token {
        self.inner.token
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.inner.tree
    }

    pub fn roster(&self) -> &Arc<Roster> {
        self.inner.tree.roster()
    }

    pub fn tree_node(&self) -> &TreeNode {
        self.inner.tree.node_at(self.inner.position)
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        self.tree_node().server_identity()
    }

    pub fn parent(&self) -> Option<&TreeNode> {
        self.tree_node()
            .parent()
            .and_then(|id| self.inner.tree.search(&id))
    }

    pub fn children(&self) -> Vec<&TreeNode> {
        self.inner.tree.children_of(&self.tree_node().id())
    }

    pub fn is_root(&self) -> bool {
        self.tree_node().is_root()
    }

    pub fn is_leaf(&self) -> bool {
        self.tree_node().is_leaf()
    }

    /// Short description for log lines.
    pub fn info(&self) -> String {
        format!("{} on {}", self.inner.token, self.server_identity())
    }

    /// The host running this instance, while it is alive.
    pub fn host(&self) -> Option<Host> {
        self.inner.host.upgrade().map(Host::from_inner)
    }

    // ── Sending ───────────────────────────────────────────────────────

    /// Send `msg` to the instance of this run on `to`.
    ///
    /// The receiving host creates that instance on first contact.
    pub async fn send_to<M: Message>(&self, to: &TreeNode, msg: &M) -> Result<(), OverlayError> {
        if self.inner.tree.search(&to.id()).is_none() {
            return Err(OverlayError::UnknownTreeNode(to.id()));
        }
        let (msg_type, data) = self.inner.messages.encode(msg).map_err(|_| {
            OverlayError::UnregisteredMessage(M::NAME.to_string())
        })?;
        let host = self.inner.host.upgrade().ok_or(OverlayError::HostClosed)?;
        let pm = ProtocolMsg {
            token: self.inner.token.with_tree_node(to.id()),
            from: self.tree_node().id(),
            msg_type,
            data,
        };
        host.deliver(to.server_identity(), pm).await
    }

    pub async fn send_to_parent<M: Message>(&self, msg: &M) -> Result<(), OverlayError> {
        let parent = self
            .parent()
            .ok_or_else(|| OverlayError::Protocol("root has no parent".into()))?;
        self.send_to(parent, msg).await
    }

    /// Send `msg` to every child. All children are tried; the last
    /// failure is returned.
    pub async fn send_to_children<M: Message>(&self, msg: &M) -> Result<(), OverlayError> {
        let mut result = Ok(());
        for child in self.children() {
            if let Err(e) = self.send_to(child, msg).await {
                tracing::debug!("{}: send to child {} failed: {e}", self.info(), child.id());
                result = Err(e);
            }
        }
        result
    }

    // ── Dispatch registration ─────────────────────────────────────────

    fn route_for<M: Message>(&self, route: Route) -> Result<(), OverlayError> {
        let msg_type = MessageTypeId::of::<M>();
        if !self.inner.messages.is_registered(&msg_type) {
            return Err(OverlayError::UnregisteredMessage(M::NAME.to_string()));
        }
        self.inner.router().add_route(msg_type, route)
    }

    /// Deliver every `M` individually on the returned mailbox.
    pub fn register_channel<M: Message>(&self) -> Result<Mailbox<Incoming<M>>, OverlayError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.route_for::<M>(Route::channel::<M>(tx))?;
        Ok(rx)
    }

    /// Deliver `M` as one batch per round, holding one message from
    /// every child. Messages from the parent, or to a leaf, come as
    /// batches of one.
    pub fn register_aggregate_channel<M: Message>(
        &self,
    ) -> Result<Mailbox<Vec<Incoming<M>>>, OverlayError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.route_for::<M>(Route::aggregate_channel::<M>(tx))?;
        Ok(rx)
    }

    /// Deliver every `M` to `P::handle` from [`run_handlers`](crate::run_handlers).
    pub fn register_handler<P: Handle<M>, M: Message>(&self) -> Result<(), OverlayError> {
        self.route_for::<M>(Route::handler::<P, M>())
    }

    /// Deliver batches of `M` to `P::handle_all`.
    pub fn register_aggregate_handler<P: HandleAll<M>, M: Message>(&self) -> Result<(), OverlayError> {
        self.route_for::<M>(Route::aggregate_handler::<P, M>())
    }

    pub fn set_flag<M: Message>(&self, flag: Flag) {
        self.inner.router().set_flag(MessageTypeId::of::<M>(), flag);
    }

    pub fn has_flag<M: Message>(&self, flag: Flag) -> bool {
        self.inner.router().has_flag(&MessageTypeId::of::<M>(), flag)
    }

    pub fn clear_flag<M: Message>(&self, flag: Flag) -> Result<(), OverlayError> {
        self.inner.router().clear_flag(MessageTypeId::of::<M>(), flag)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Finish this instance. Its mailboxes close and later messages for
    /// its token are dropped. Idempotent.
    pub fn done(&self) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.router().close();
        if let Some(host) = self.inner.host.upgrade() {
            host.overlay().finish(&self.inner.token);
        }
        tracing::trace!("{} done", self.info());
    }

    pub fn is_done(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Close the whole host this instance runs on.
    pub async fn close_host(&self) -> Result<(), OverlayError> {
        let host = self.inner.host.upgrade().ok_or(OverlayError::HostClosed)?;
        Host::from_inner(host).close().await
    }

    // ── Overlay side ──────────────────────────────────────────────────

    pub(crate) fn is_bound(&self) -> bool {
        self.inner.router().is_bound()
    }

    /// Returns false if the instance was already bound or is finished.
    pub(crate) fn bind(&self) -> bool {
        self.inner.router().bind()
    }

    /// Stop without marking the token as finished.
    pub(crate) fn discard(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
        self.inner.router().close();
    }

    pub(crate) fn route(
        &self,
        from: TreeNode,
        msg_type: MessageTypeId,
        msg: AnyMessage,
    ) -> Result<(), OverlayError> {
        self.inner.router().route(from, msg_type, msg)
    }

    pub(crate) fn report(&self, err: OverlayError) {
        self.inner.router().report(err);
    }

    pub(crate) fn take_handler_queues(&self) -> Result<HandlerQueues, OverlayError> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| OverlayError::Protocol("handler loop already running".into()))
    }
}

impl fmt::Debug for TreeNodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNodeInstance")
            .field("token", &self.inner.token)
            .field("node", &self.tree_node().id())
            .field("done", &self.is_done())
            .finish()
    }
}
