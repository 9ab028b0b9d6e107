/// Liveness barrier: counts the nodes of a tree that answer in time.
///
/// The root sends `PrepareCount` down the tree. Every node first tells
/// its parent `NodeIsUp`, which travels up to the root and keeps it
/// waiting, then forwards `PrepareCount` to its children. Leaves answer
/// `Count { children: 1 }`; every inner node waits for all its children,
/// adds itself and sends the sum up. The root reports the sum, or, after
/// a quiet period, how many nodes said they were up.
use arbor_transport::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::{
    Host, Incoming, Mailbox, OverlayError, ProtocolId, ProtocolInstance, Registry, Tree,
    TreeNodeInstance,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareCount {
    pub timeout_ms: u64,
}

impl Message for PrepareCount {
    const NAME: &'static str = "arbor.count.PrepareCount";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIsUp {}

impl Message for NodeIsUp {
    const NAME: &'static str = "arbor.count.NodeIsUp";
}

/// Size of the subtree rooted at the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Count {
    pub children: usize,
}

impl Message for Count {
    const NAME: &'static str = "arbor.count.Count";
}

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1024);

pub struct CountProtocol {
    node: TreeNodeInstance,
    timeout: Duration,
    replies: usize,
    finished: bool,
    result_tx: Option<oneshot::Sender<usize>>,
    result_rx: Option<oneshot::Receiver<usize>>,
    prepare: Mailbox<Incoming<PrepareCount>>,
    counts: Mailbox<Vec<Incoming<Count>>>,
    up: Mailbox<Incoming<NodeIsUp>>,
}

impl CountProtocol {
    pub const NAME: &'static str = "Count";

    pub fn new(node: TreeNodeInstance) -> Result<Self, OverlayError> {
        let prepare = node.register_channel::<PrepareCount>()?;
        let counts = node.register_aggregate_channel::<Count>()?;
        let up = node.register_channel::<NodeIsUp>()?;
        let (result_tx, result_rx) = oneshot::channel();
        Ok(Self {
            node,
            timeout: DEFAULT_TIMEOUT,
            replies: 0,
            finished: false,
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            prepare,
            counts,
            up,
        })
    }

    /// Register the protocol and its messages.
    pub fn register(registry: &mut Registry) -> Result<ProtocolId, OverlayError> {
        registry.register_message::<PrepareCount>()?;
        registry.register_message::<NodeIsUp>()?;
        registry.register_message::<Count>()?;
        registry.register_protocol(Self::NAME, |node| {
            Ok(Box::new(CountProtocol::new(node)?) as Box<dyn ProtocolInstance>)
        })
    }

    /// Inactivity timeout, passed down the tree with `PrepareCount`.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Receiver of the number of nodes counted. Only the root sends on it.
    pub fn take_result(&mut self) -> Option<oneshot::Receiver<usize>> {
        self.result_rx.take()
    }

    fn report(&mut self, count: usize) {
        tracing::debug!("{}: counted {count} nodes", self.node.info());
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(count);
        }
        self.finished = true;
    }

    /// Announce this node and pass the count request on.
    async fn prepare(&mut self) {
        if let Some(parent) = self.node.parent() {
            if let Err(e) = self.node.send_to(parent, &NodeIsUp {}).await {
                tracing::warn!("{}: NodeIsUp to parent failed: {e}", self.node.info());
            }
        }
        if self.node.is_leaf() {
            self.count(Vec::new()).await;
            return;
        }
        let msg = PrepareCount {
            timeout_ms: self.timeout.as_millis() as u64,
        };
        if let Err(e) = self.node.send_to_children(&msg).await {
            tracing::warn!("{}: PrepareCount to children failed: {e}", self.node.info());
        }
    }

    async fn count(&mut self, batch: Vec<Incoming<Count>>) {
        let count = 1 + batch.iter().map(|c| c.msg.children).sum::<usize>();
        match self.node.parent() {
            Some(parent) => {
                if let Err(e) = self.node.send_to(parent, &Count { children: count }).await {
                    tracing::warn!("{}: Count to parent failed: {e}", self.node.info());
                }
                self.finished = true;
            }
            None => self.report(count),
        }
    }
}

#[async_trait]
impl ProtocolInstance for CountProtocol {
    fn node(&self) -> &TreeNodeInstance {
        &self.node
    }

    async fn start(&mut self) -> Result<(), OverlayError> {
        tracing::debug!("{}: starting count", self.node.info());
        self.prepare().await;
        Ok(())
    }

    async fn dispatch(&mut self) -> Result<(), OverlayError> {
        while !self.finished {
            // NodeIsUp is forwarded before a final Count can finish us.
            tokio::select! {
                biased;
                Some(_) = self.up.recv() => {
                    match self.node.parent() {
                        Some(parent) => {
                            if let Err(e) = self.node.send_to(parent, &NodeIsUp {}).await {
                                tracing::warn!("{}: NodeIsUp to parent failed: {e}", self.node.info());
                            }
                        }
                        None => self.replies += 1,
                    }
                }
                Some(pc) = self.prepare.recv() => {
                    self.timeout = Duration::from_millis(pc.msg.timeout_ms);
                    self.prepare().await;
                }
                Some(batch) = self.counts.recv() => {
                    self.count(batch).await;
                }
                _ = tokio::time::sleep(self.timeout) => {
                    tracing::debug!("{}: quiet for {:?}", self.node.info(), self.timeout);
                    if self.node.is_root() {
                        self.report(self.replies + 1);
                    }
                    self.finished = true;
                }
            }
        }
        Ok(())
    }
}

/// Count the nodes of `tree` from `host`, doubling the timeout until all
/// `expected` nodes answer.
pub async fn count_with_retry(
    host: &Host,
    tree: &Arc<Tree>,
    expected: usize,
) -> Result<usize, OverlayError> {
    const ATTEMPTS: usize = 5;
    let mut timeout = Duration::from_secs(1);
    let mut last = 0;
    for attempt in 1..=ATTEMPTS {
        let mut p = host.create_protocol_typed::<CountProtocol>(CountProtocol::NAME, tree)?;
        p.set_timeout(timeout);
        let result = p
            .take_result()
            .ok_or_else(|| OverlayError::Protocol("count result already taken".into()))?;
        host.start_protocol(p).await?;
        match result.await {
            Ok(n) if n == expected => return Ok(n),
            Ok(n) => {
                tracing::info!("count attempt {attempt}: {n} of {expected} nodes after {timeout:?}");
                last = n;
            }
            Err(_) => tracing::warn!("count attempt {attempt} ended without a result"),
        }
        timeout *= 2;
    }
    Err(OverlayError::Protocol(format!(
        "only {last} of {expected} nodes answered after {ATTEMPTS} attempts"
    )))
}
