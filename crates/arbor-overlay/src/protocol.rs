use async_trait::async_trait;
use std::any::Any;
use tokio::sync::mpsc;

use crate::{OverlayError, TreeNode, TreeNodeInstance};

/// A message as delivered to a protocol instance, with the tree node it
/// came from.
#[derive(Debug, Clone)]
pub struct Incoming<M> {
    pub from: TreeNode,
    pub msg: M,
}

/// Receiving end of a registered channel.
pub type Mailbox<T> = mpsc::Receiver<T>;

/// Type erasure for protocol instances, implemented for every sized type.
pub trait AsAny {
    fn as_any(&self) -> &(dyn Any + Send);
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send);
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &(dyn Any + Send) {
        self
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send) {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// One node's state for one run of a distributed protocol.
///
/// The overlay owns every instance in its own task: a locally started
/// root runs `start` then `dispatch`, an instance created by an incoming
/// message runs `dispatch` only. When `dispatch` returns the overlay calls
/// `done`, after which messages for the instance's token are dropped.
///
/// State inside the instance is only touched by that task; other
/// instances reach it through messages.
#[async_trait]
pub trait ProtocolInstance: AsAny + Send + 'static {
    fn node(&self) -> &TreeNodeInstance;

    /// Kick off the run. Called on the instance that initiated it, before
    /// `dispatch`. Must not wait for replies.
    async fn start(&mut self) -> Result<(), OverlayError> {
        Ok(())
    }

    /// Message loop. Returning ends the instance.
    async fn dispatch(&mut self) -> Result<(), OverlayError>;

    /// Teardown hook. Overrides should end with `self.node().done()`.
    fn done(&mut self) {
        self.node().done();
    }
}

/// Handler-style delivery of single messages of type `M`.
#[async_trait]
pub trait Handle<M: Send + 'static>: Send + 'static {
    async fn handle(&mut self, msg: Incoming<M>) -> Result<(), OverlayError>;
}

/// Handler-style delivery of aggregated batches of `M`, one message per
/// child in tree order.
#[async_trait]
pub trait HandleAll<M: Send + 'static>: Send + 'static {
    async fn handle_all(&mut self, msgs: Vec<Incoming<M>>) -> Result<(), OverlayError>;
}

/// Take a protocol instance back out of its box.
pub fn downcast_protocol<P: ProtocolInstance>(
    p: Box<dyn ProtocolInstance>,
) -> Result<Box<P>, OverlayError> {
    AsAny::into_any(p)
        .downcast::<P>()
        .map_err(|_| OverlayError::HandlerMismatch)
}
