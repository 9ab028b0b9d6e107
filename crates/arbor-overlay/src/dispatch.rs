/// Per-instance demultiplexing of incoming messages.
///
/// Every instance owns one [`Router`] that maps message types to routes.
/// A route delivers either to a channel the protocol reads from or to a
/// handler called from [`run_handlers`]. Aggregating routes buffer
/// messages per child and release one batch, in the tree's child order,
/// once every child has reported.
use arbor_transport::{AnyMessage, Message, MessageTypeId};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{AsAny, Handle, HandleAll, Incoming, OverlayError, ProtocolInstance, TreeNode, TreeNodeId};

pub(crate) type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), OverlayError>> + Send + 'a>>;

/// Type-erased handler: downcasts the instance and the message, then calls
/// the typed `Handle`/`HandleAll` implementation.
pub(crate) type HandlerFn = for<'a> fn(&'a mut (dyn Any + Send), AnyMessage) -> HandlerFuture<'a>;

pub(crate) type HandlerCall = (HandlerFn, AnyMessage);

/// Runtime toggles on a message type, owned by the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Wait for every child before delivering, also on a single-message
    /// route. Items are then handed over one at a time in child order.
    Aggregate,
}

impl Flag {
    fn bit(self) -> u32 {
        match self {
            Flag::Aggregate => 1,
        }
    }
}

// ── Routes ────────────────────────────────────────────────────────────

trait ChannelSink: Send {
    fn push(&self, item: AnyMessage) -> Result<(), TrySendError<()>>;
}

impl<T: Send + 'static> ChannelSink for mpsc::Sender<T> {
    fn push(&self, item: AnyMessage) -> Result<(), TrySendError<()>> {
        match item.downcast::<T>() {
            Ok(item) => self.try_send(*item).map_err(|e| match e {
                TrySendError::Full(_) => TrySendError::Full(()),
                TrySendError::Closed(_) => TrySendError::Closed(()),
            }),
            Err(_) => Err(TrySendError::Closed(())),
        }
    }
}

enum Sink {
    Channel(Box<dyn ChannelSink>),
    Handler(HandlerFn),
}

type Pending = (TreeNode, AnyMessage);

pub(crate) struct Route {
    name: &'static str,
    aggregate: bool,
    sink: Sink,
    wrap_one: fn(TreeNode, AnyMessage) -> Option<AnyMessage>,
    wrap_batch: fn(Vec<Pending>) -> AnyMessage,
    waiting: HashMap<TreeNodeId, VecDeque<Pending>>,
}

fn wrap_one<M: Message>(from: TreeNode, msg: AnyMessage) -> Option<AnyMessage> {
    let msg = msg.downcast::<M>().ok()?;
    Some(Box::new(Incoming { from, msg: *msg }))
}

fn wrap_batch<M: Message>(items: Vec<Pending>) -> AnyMessage {
    let batch: Vec<Incoming<M>> = items
        .into_iter()
        .filter_map(|(from, msg)| msg.downcast::<M>().ok().map(|m| Incoming { from, msg: *m }))
        .collect();
    Box::new(batch)
}

fn call_one<P: Handle<M>, M: Message>(p: &mut (dyn Any + Send), msg: AnyMessage) -> HandlerFuture<'_> {
    match (p.downcast_mut::<P>(), msg.downcast::<Incoming<M>>()) {
        (Some(p), Ok(msg)) => p.handle(*msg),
        _ => Box::pin(async { Err(OverlayError::HandlerMismatch) }),
    }
}

fn call_all<P: HandleAll<M>, M: Message>(p: &mut (dyn Any + Send), msg: AnyMessage) -> HandlerFuture<'_> {
    match (p.downcast_mut::<P>(), msg.downcast::<Vec<Incoming<M>>>()) {
        (Some(p), Ok(msgs)) => p.handle_all(*msgs),
        _ => Box::pin(async { Err(OverlayError::HandlerMismatch) }),
    }
}

impl Route {
    fn new<M: Message>(aggregate: bool, sink: Sink) -> Self {
        Self {
            name: M::NAME,
            aggregate,
            sink,
            wrap_one: wrap_one::<M>,
            wrap_batch: wrap_batch::<M>,
            waiting: HashMap::new(),
        }
    }

    pub(crate) fn channel<M: Message>(tx: mpsc::Sender<Incoming<M>>) -> Self {
        Self::new::<M>(false, Sink::Channel(Box::new(tx)))
    }

    pub(crate) fn aggregate_channel<M: Message>(tx: mpsc::Sender<Vec<Incoming<M>>>) -> Self {
        Self::new::<M>(true, Sink::Channel(Box::new(tx)))
    }

    pub(crate) fn handler<P: Handle<M>, M: Message>() -> Self {
        Self::new::<M>(false, Sink::Handler(call_one::<P, M>))
    }

    pub(crate) fn aggregate_handler<P: HandleAll<M>, M: Message>() -> Self {
        Self::new::<M>(true, Sink::Handler(call_all::<P, M>))
    }

    fn deliver(
        &self,
        handler_tx: &Option<mpsc::Sender<HandlerCall>>,
        item: AnyMessage,
    ) -> Result<(), OverlayError> {
        let result = match (&self.sink, handler_tx) {
            (Sink::Channel(tx), _) => tx.push(item),
            (Sink::Handler(f), Some(tx)) => tx.try_send((*f, item)).map_err(|e| match e {
                TrySendError::Full(_) => TrySendError::Full(()),
                TrySendError::Closed(_) => TrySendError::Closed(()),
            }),
            (Sink::Handler(_), None) => Err(TrySendError::Closed(())),
        };
        result.map_err(|e| match e {
            TrySendError::Full(()) => OverlayError::MailboxFull(self.name.to_string()),
            TrySendError::Closed(()) => OverlayError::InstanceClosed,
        })
    }

    fn deliver_one(
        &self,
        handler_tx: &Option<mpsc::Sender<HandlerCall>>,
        from: TreeNode,
        msg: AnyMessage,
    ) -> Result<(), OverlayError> {
        let item = (self.wrap_one)(from, msg).ok_or(OverlayError::HandlerMismatch)?;
        self.deliver(handler_tx, item)
    }

    fn deliver_all(
        &self,
        handler_tx: &Option<mpsc::Sender<HandlerCall>>,
        items: Vec<Pending>,
    ) -> Result<(), OverlayError> {
        if self.aggregate {
            return self.deliver(handler_tx, (self.wrap_batch)(items));
        }
        for (from, msg) in items {
            self.deliver_one(handler_tx, from, msg)?;
        }
        Ok(())
    }

    /// Pop one message per child if every child has one queued.
    fn take_round(&mut self, children: &[TreeNodeId]) -> Option<Vec<Pending>> {
        let complete = children
            .iter()
            .all(|c| self.waiting.get(c).is_some_and(|q| !q.is_empty()));
        if !complete {
            return None;
        }
        Some(
            children
                .iter()
                .filter_map(|c| self.waiting.get_mut(c).and_then(VecDeque::pop_front))
                .collect(),
        )
    }

    /// Everything still queued, child by child.
    fn drain(&mut self, children: &[TreeNodeId]) -> Vec<Pending> {
        let mut out = Vec::new();
        for c in children {
            if let Some(q) = self.waiting.remove(c) {
                out.extend(q);
            }
        }
        out
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub(crate) struct Router {
    routes: HashMap<MessageTypeId, Route>,
    flags: HashMap<MessageTypeId, u32>,
    handler_tx: Option<mpsc::Sender<HandlerCall>>,
    error_tx: Option<mpsc::Sender<OverlayError>>,
    children: Vec<TreeNodeId>,
    bound: bool,
    closed: bool,
    backlog: VecDeque<(TreeNode, MessageTypeId, AnyMessage)>,
    capacity: usize,
}

pub(crate) type HandlerQueues = (mpsc::Receiver<HandlerCall>, mpsc::Receiver<OverlayError>);

impl Router {
    /// Router for a node with the given children, plus the receiving ends
    /// of its handler and error queues.
    pub(crate) fn new(children: Vec<TreeNodeId>, capacity: usize) -> (Router, HandlerQueues) {
        let (handler_tx, handler_rx) = mpsc::channel(capacity);
        let (error_tx, error_rx) = mpsc::channel(capacity);
        let router = Router {
            routes: HashMap::new(),
            flags: HashMap::new(),
            handler_tx: Some(handler_tx),
            error_tx: Some(error_tx),
            children,
            bound: false,
            closed: false,
            backlog: VecDeque::new(),
            capacity,
        };
        (router, (handler_rx, error_rx))
    }

    pub(crate) fn add_route(&mut self, msg_type: MessageTypeId, route: Route) -> Result<(), OverlayError> {
        if self.closed {
            return Err(OverlayError::InstanceClosed);
        }
        if let Some(existing) = self.routes.get(&msg_type) {
            return Err(OverlayError::DuplicateRegistration {
                what: format!("route for {}", existing.name),
            });
        }
        self.routes.insert(msg_type, route);
        Ok(())
    }

    pub(crate) fn set_flag(&mut self, msg_type: MessageTypeId, flag: Flag) {
        *self.flags.entry(msg_type).or_default() |= flag.bit();
    }

    pub(crate) fn has_flag(&self, msg_type: &MessageTypeId, flag: Flag) -> bool {
        self.flags.get(msg_type).is_some_and(|f| f & flag.bit() != 0)
    }

    /// Clear `flag`. Messages held back by [`Flag::Aggregate`] on a
    /// single-message route are released.
    pub(crate) fn clear_flag(&mut self, msg_type: MessageTypeId, flag: Flag) -> Result<(), OverlayError> {
        if let Some(f) = self.flags.get_mut(&msg_type) {
            *f &= !flag.bit();
        }
        if flag != Flag::Aggregate {
            return Ok(());
        }
        let Router {
            routes,
            handler_tx,
            children,
            ..
        } = self;
        match routes.get_mut(&msg_type) {
            Some(route) if !route.aggregate => {
                let held = route.drain(children);
                route.deliver_all(handler_tx, held)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound
    }

    /// Mark the instance as live and replay messages that arrived before.
    /// Returns false if it was already bound or closed.
    pub(crate) fn bind(&mut self) -> bool {
        if self.bound || self.closed {
            return false;
        }
        self.bound = true;
        while let Some((from, msg_type, msg)) = self.backlog.pop_front() {
            if let Err(e) = self.route(from, msg_type, msg) {
                tracing::debug!("dropping backlogged message: {e}");
            }
        }
        true
    }

    /// Drop every route; channel and handler receivers see the end of
    /// their streams.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.routes.clear();
        self.backlog.clear();
        self.handler_tx = None;
        self.error_tx = None;
    }

    /// Hand `err` to the instance's handler loop.
    pub(crate) fn report(&mut self, err: OverlayError) {
        if let Some(tx) = &self.error_tx {
            let _ = tx.try_send(err);
        }
    }

    pub(crate) fn route(
        &mut self,
        from: TreeNode,
        msg_type: MessageTypeId,
        msg: AnyMessage,
    ) -> Result<(), OverlayError> {
        if self.closed {
            return Err(OverlayError::InstanceClosed);
        }
        if !self.bound {
            if self.backlog.len() >= self.capacity {
                return Err(OverlayError::MailboxFull("unbound instance".into()));
            }
            self.backlog.push_back((from, msg_type, msg));
            return Ok(());
        }

        let aggregate_flag = self.has_flag(&msg_type, Flag::Aggregate);
        if !self.routes.contains_key(&msg_type) {
            self.report(OverlayError::NoRoute(msg_type.to_string()));
            return Err(OverlayError::NoRoute(msg_type.to_string()));
        }
        let Router {
            routes,
            handler_tx,
            children,
            ..
        } = self;
        let Some(route) = routes.get_mut(&msg_type) else {
            return Err(OverlayError::NoRoute(msg_type.to_string()));
        };

        if !(route.aggregate || aggregate_flag) {
            return route.deliver_one(handler_tx, from, msg);
        }
        if !children.contains(&from.id()) {
            // Only children are waited for; anything else is a round of one.
            return route.deliver_all(handler_tx, vec![(from, msg)]);
        }

        route
            .waiting
            .entry(from.id())
            .or_default()
            .push_back((from, msg));
        match route.take_round(children) {
            Some(items) => route.deliver_all(handler_tx, items),
            None => Ok(()),
        }
    }
}

// ── Handler loop ──────────────────────────────────────────────────────

/// Dispatch loop for handler-style protocols.
///
/// Calls the handlers registered with `register_handler` and
/// `register_aggregate_handler` in arrival order until the instance is
/// done. A message without a route, or a failing handler, ends the loop
/// with that error.
pub async fn run_handlers<P: ProtocolInstance>(p: &mut P) -> Result<(), OverlayError> {
    let (mut calls, mut errors) = p.node().take_handler_queues()?;
    loop {
        tokio::select! {
            call = calls.recv() => match call {
                Some((handler, msg)) => handler(<P as AsAny>::as_any_mut(p), msg).await?,
                None => return Ok(()),
            },
            Some(err) = errors.recv() => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Roster, Tree};
    use arbor_transport::{Keypair, ServerIdentity};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Vote(u32);

    impl Message for Vote {
        const NAME: &'static str = "test.Vote";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Other;

    impl Message for Other {
        const NAME: &'static str = "test.Other";
    }

    /// Root with `n` children.
    fn star(n: u8) -> Tree {
        let roster = Arc::new(Roster::new(
            (0..=n)
                .map(|i| ServerIdentity::new(Keypair::from_seed(&[i; 32]).public(), vec![]))
                .collect(),
        ));
        roster.generate_tree(n as usize, n as usize + 1).unwrap()
    }

    fn router_for(tree: &Tree) -> (Router, HandlerQueues) {
        let (mut router, queues) = Router::new(tree.root().children().to_vec(), 16);
        router.bind();
        (router, queues)
    }

    fn vote() -> MessageTypeId {
        MessageTypeId::of::<Vote>()
    }

    #[test]
    fn single_route_delivers_immediately() {
        let tree = star(2);
        let (mut router, _queues) = router_for(&tree);
        let (tx, mut rx) = mpsc::channel(4);
        router.add_route(vote(), Route::channel::<Vote>(tx)).unwrap();

        let child = tree.node_at(1).clone();
        router.route(child.clone(), vote(), Box::new(Vote(7))).unwrap();
        let got = rx.try_recv().unwrap();
        assert_eq!(got.msg, Vote(7));
        assert_eq!(got.from.id(), child.id());
    }

    #[test]
    fn aggregate_waits_for_every_child() {
        let tree = star(3);
        let (mut router, _queues) = router_for(&tree);
        let (tx, mut rx) = mpsc::channel(4);
        router.add_route(vote(), Route::aggregate_channel::<Vote>(tx)).unwrap();

        router.route(tree.node_at(2).clone(), vote(), Box::new(Vote(2))).unwrap();
        router.route(tree.node_at(1).clone(), vote(), Box::new(Vote(1))).unwrap();
        assert!(rx.try_recv().is_err());

        // A second report from the same child does not complete the round.
        router.route(tree.node_at(1).clone(), vote(), Box::new(Vote(10))).unwrap();
        assert!(rx.try_recv().is_err());

        router.route(tree.node_at(3).clone(), vote(), Box::new(Vote(3))).unwrap();
        let batch: Vec<u32> = rx.try_recv().unwrap().into_iter().map(|m| m.msg.0).collect();
        assert_eq!(batch, vec![1, 2, 3]);

        // The extra report opens the next round.
        router.route(tree.node_at(2).clone(), vote(), Box::new(Vote(20))).unwrap();
        router.route(tree.node_at(3).clone(), vote(), Box::new(Vote(30))).unwrap();
        let batch: Vec<u32> = rx.try_recv().unwrap().into_iter().map(|m| m.msg.0).collect();
        assert_eq!(batch, vec![10, 20, 30]);
    }

    #[test]
    fn aggregate_at_leaf_delivers_batches_of_one() {
        let tree = star(2);
        let leaf = tree.node_at(1);
        let (mut router, _queues) = Router::new(leaf.children().to_vec(), 4);
        router.bind();
        let (tx, mut rx) = mpsc::channel(4);
        router.add_route(vote(), Route::aggregate_channel::<Vote>(tx)).unwrap();

        router.route(tree.root().clone(), vote(), Box::new(Vote(1))).unwrap();
        assert_eq!(rx.try_recv().unwrap().len(), 1);
    }

    #[test]
    fn flag_turns_single_route_into_barrier() {
        let tree = star(2);
        let (mut router, _queues) = router_for(&tree);
        let (tx, mut rx) = mpsc::channel(4);
        router.add_route(vote(), Route::channel::<Vote>(tx)).unwrap();
        router.set_flag(vote(), Flag::Aggregate);
        assert!(router.has_flag(&vote(), Flag::Aggregate));

        router.route(tree.node_at(2).clone(), vote(), Box::new(Vote(2))).unwrap();
        assert!(rx.try_recv().is_err());
        router.route(tree.node_at(1).clone(), vote(), Box::new(Vote(1))).unwrap();
        assert_eq!(rx.try_recv().unwrap().msg, Vote(1));
        assert_eq!(rx.try_recv().unwrap().msg, Vote(2));

        // Clearing the flag releases what is held back.
        router.route(tree.node_at(1).clone(), vote(), Box::new(Vote(3))).unwrap();
        assert!(rx.try_recv().is_err());
        router.clear_flag(vote(), Flag::Aggregate).unwrap();
        assert!(!router.has_flag(&vote(), Flag::Aggregate));
        assert_eq!(rx.try_recv().unwrap().msg, Vote(3));
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let tree = star(1);
        let (mut router, _queues) = router_for(&tree);
        let (tx, _rx) = mpsc::channel::<Incoming<Vote>>(1);
        router.add_route(vote(), Route::channel::<Vote>(tx.clone())).unwrap();
        assert!(matches!(
            router.add_route(vote(), Route::channel::<Vote>(tx)),
            Err(OverlayError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn unrouted_type_is_reported_to_instance() {
        let tree = star(1);
        let (mut router, (_calls, mut errors)) = router_for(&tree);
        let other = MessageTypeId::of::<Other>();
        assert!(matches!(
            router.route(tree.node_at(1).clone(), other, Box::new(Other)),
            Err(OverlayError::NoRoute(_))
        ));
        assert!(matches!(errors.try_recv(), Ok(OverlayError::NoRoute(_))));
    }

    #[test]
    fn full_mailbox_rejects() {
        let tree = star(1);
        let (mut router, _queues) = router_for(&tree);
        let (tx, _rx) = mpsc::channel(1);
        router.add_route(vote(), Route::channel::<Vote>(tx)).unwrap();
        let child = tree.node_at(1).clone();
        router.route(child.clone(), vote(), Box::new(Vote(1))).unwrap();
        assert!(matches!(
            router.route(child, vote(), Box::new(Vote(2))),
            Err(OverlayError::MailboxFull(_))
        ));
    }

    #[test]
    fn unbound_router_backlogs_until_bind() {
        let tree = star(1);
        let (mut router, _queues) = Router::new(tree.root().children().to_vec(), 4);
        let (tx, mut rx) = mpsc::channel(4);
        router.add_route(vote(), Route::channel::<Vote>(tx)).unwrap();

        router.route(tree.node_at(1).clone(), vote(), Box::new(Vote(5))).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(router.bind());
        assert!(!router.bind());
        assert_eq!(rx.try_recv().unwrap().msg, Vote(5));
    }

    #[test]
    fn closed_router_ends_streams() {
        let tree = star(1);
        let (mut router, (mut calls, _errors)) = router_for(&tree);
        let (tx, mut rx) = mpsc::channel::<Incoming<Vote>>(4);
        router.add_route(vote(), Route::channel::<Vote>(tx)).unwrap();
        router.close();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            calls.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            router.route(tree.node_at(1).clone(), vote(), Box::new(Vote(1))),
            Err(OverlayError::InstanceClosed)
        ));
    }

    proptest! {
        /// Whatever order the children report in, one batch comes out, in
        /// child order.
        #[test]
        fn aggregation_ignores_arrival_order(order in Just((1..=5usize).collect::<Vec<_>>()).prop_shuffle()) {
            let tree = star(5);
            let (mut router, _queues) = router_for(&tree);
            let (tx, mut rx) = mpsc::channel(4);
            router.add_route(vote(), Route::aggregate_channel::<Vote>(tx)).unwrap();

            for (i, &pos) in order.iter().enumerate() {
                prop_assert!(rx.try_recv().is_err());
                router.route(tree.node_at(pos).clone(), vote(), Box::new(Vote(pos as u32))).unwrap();
                if i + 1 < order.len() {
                    prop_assert!(rx.try_recv().is_err());
                }
            }
            let batch = rx.try_recv().unwrap();
            let from: Vec<_> = batch.iter().map(|m| m.from.id()).collect();
            prop_assert_eq!(from, tree.root().children().to_vec());
            let votes: Vec<u32> = batch.into_iter().map(|m| m.msg.0).collect();
            prop_assert_eq!(votes, vec![1, 2, 3, 4, 5]);
            prop_assert!(rx.try_recv().is_err());
        }
    }
}
