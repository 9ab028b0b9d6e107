/// Two-phase shutdown of every host in a tree.
///
/// `PrepareClose` travels from the root to the leaves. A leaf answers
/// `Close` to its parent and shuts its host down; an inner node does the
/// same once `Close` arrived from all of its children. The root closes its
/// own host last and reports through [`CloseAllProtocol::take_done`]. No
/// host closes before its whole subtree has.
use arbor_transport::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::{
    run_handlers, Handle, HandleAll, Incoming, OverlayError, ProtocolId, ProtocolInstance,
    Registry, TreeNodeId, TreeNodeInstance,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareClose {}

impl Message for PrepareClose {
    const NAME: &'static str = "arbor.close.PrepareClose";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Close {}

impl Message for Close {
    const NAME: &'static str = "arbor.close.Close";
}

/// Time a non-root host keeps running after sending `Close`, so the frame
/// leaves before its connections are torn down.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Called with the node id when a node starts closing.
pub type CloseObserver = Arc<dyn Fn(TreeNodeId) + Send + Sync>;

pub struct CloseAllProtocol {
    node: TreeNodeInstance,
    done_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
    observer: Option<CloseObserver>,
}

impl CloseAllProtocol {
    pub const NAME: &'static str = "CloseAll";

    pub fn new(node: TreeNodeInstance) -> Result<Self, OverlayError> {
        node.register_handler::<Self, PrepareClose>()?;
        node.register_aggregate_handler::<Self, Close>()?;
        let (done_tx, done_rx) = oneshot::channel();
        Ok(Self {
            node,
            done_tx: Some(done_tx),
            done_rx: Some(done_rx),
            observer: None,
        })
    }

    pub fn with_observer(node: TreeNodeInstance, observer: CloseObserver) -> Result<Self, OverlayError> {
        let mut p = Self::new(node)?;
        p.observer = Some(observer);
        Ok(p)
    }

    pub fn register_messages(registry: &mut Registry) -> Result<(), OverlayError> {
        registry.register_message::<PrepareClose>()?;
        registry.register_message::<Close>()?;
        Ok(())
    }

    pub fn register(registry: &mut Registry) -> Result<ProtocolId, OverlayError> {
        Self::register_messages(registry)?;
        registry.register_protocol(Self::NAME, |node| {
            Ok(Box::new(CloseAllProtocol::new(node)?) as Box<dyn ProtocolInstance>)
        })
    }

    /// Resolves on the root once every host, its own included, has closed.
    pub fn take_done(&mut self) -> Option<oneshot::Receiver<()>> {
        self.done_rx.take()
    }

    async fn prepare_close(&mut self) -> Result<(), OverlayError> {
        if self.node.is_leaf() {
            return self.close().await;
        }
        if let Err(e) = self.node.send_to_children(&PrepareClose {}).await {
            tracing::warn!("{}: PrepareClose to children failed: {e}", self.node.info());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OverlayError> {
        if let Some(observer) = &self.observer {
            observer(self.node.tree_node().id());
        }
        if self.node.is_root() {
            tracing::debug!("{}: every other host closed", self.node.info());
            self.node.done();
            let result = self.close_host().await;
            if let Some(tx) = self.done_tx.take() {
                let _ = tx.send(());
            }
            return result;
        }

        if let Err(e) = self.node.send_to_parent(&Close {}).await {
            tracing::warn!("{}: Close to parent failed: {e}", self.node.info());
        }
        self.node.done();
        tokio::time::sleep(CLOSE_GRACE).await;
        self.close_host().await
    }

    async fn close_host(&self) -> Result<(), OverlayError> {
        tracing::debug!("{}: closing host", self.node.info());
        match self.node.close_host().await {
            Ok(()) | Err(OverlayError::HostClosed) => Ok(()),
            Err(OverlayError::Transport(e)) if e.is_closed() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProtocolInstance for CloseAllProtocol {
    fn node(&self) -> &TreeNodeInstance {
        &self.node
    }

    async fn start(&mut self) -> Result<(), OverlayError> {
        self.prepare_close().await
    }

    async fn dispatch(&mut self) -> Result<(), OverlayError> {
        run_handlers(self).await
    }
}

#[async_trait]
impl Handle<PrepareClose> for CloseAllProtocol {
    async fn handle(&mut self, _msg: Incoming<PrepareClose>) -> Result<(), OverlayError> {
        self.prepare_close().await
    }
}

#[async_trait]
impl HandleAll<Close> for CloseAllProtocol {
    async fn handle_all(&mut self, msgs: Vec<Incoming<Close>>) -> Result<(), OverlayError> {
        tracing::trace!("{}: {} children closed", self.node.info(), msgs.len());
        self.close().await
    }
}
