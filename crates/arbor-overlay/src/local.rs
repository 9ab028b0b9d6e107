use arbor_transport::Keypair;
use std::sync::Arc;

use crate::{Host, HostConfig, OverlayError, ProtocolInstance, Registry, Roster, Tree};

/// In-process test network: several hosts on loopback ports sharing one
/// registry.
///
/// ```no_run
/// use arbor_overlay::{LocalTest, Registry};
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), arbor_overlay::OverlayError> {
/// let mut local = LocalTest::new(Arc::new(Registry::with_builtin_protocols()?));
/// let (hosts, tree) = local.gen_tree(7, true).await?;
/// let count = arbor_overlay::protocols::count_with_retry(&hosts[0], &tree, 7).await?;
/// assert_eq!(count, 7);
/// local.close_all().await;
/// # Ok(())
/// # }
/// ```
pub struct LocalTest {
    registry: Arc<Registry>,
    config: HostConfig,
    hosts: Vec<Host>,
}

impl LocalTest {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            config: HostConfig::new(),
            hosts: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Start `n` more hosts on ephemeral loopback ports.
    pub async fn gen_hosts(&mut self, n: usize) -> Result<Vec<Host>, OverlayError> {
        let mut started = Vec::with_capacity(n);
        for _ in 0..n {
            let host = Host::bind(
                Keypair::generate(),
                "127.0.0.1:0",
                self.registry.clone(),
                self.config.clone(),
            )
            .await?;
            started.push(host);
        }
        self.hosts.extend(started.iter().cloned());
        Ok(started)
    }

    /// Start `n` hosts and build a binary tree over them, rooted at the
    /// first. With `register`, every host learns the tree up front;
    /// otherwise they ask the sender for it on first contact.
    pub async fn gen_tree(
        &mut self,
        n: usize,
        register: bool,
    ) -> Result<(Vec<Host>, Arc<Tree>), OverlayError> {
        let hosts = self.gen_hosts(n).await?;
        let roster = Arc::new(Roster::new(
            hosts.iter().map(|h| h.identity().clone()).collect(),
        ));
        let tree = Arc::new(roster.generate_binary_tree()?);
        if register {
            for host in &hosts {
                host.register_tree(tree.clone());
            }
        } else if let Some(root) = hosts.first() {
            root.register_tree(tree.clone());
        }
        Ok((hosts, tree))
    }

    /// Create `protocol` on the root host of `tree`.
    pub fn create_protocol(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
    ) -> Result<Box<dyn ProtocolInstance>, OverlayError> {
        self.root_host(tree)?.create_protocol(protocol, tree)
    }

    /// Create and start `protocol` on the root host of `tree`.
    pub async fn start_protocol(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
    ) -> Result<(), OverlayError> {
        let host = self.root_host(tree)?;
        let p = host.create_protocol(protocol, tree)?;
        host.start_protocol(p).await
    }

    fn root_host(&self, tree: &Tree) -> Result<&Host, OverlayError> {
        let root = tree.root().server_identity().id();
        self.hosts
            .iter()
            .find(|h| h.identity().id() == root)
            .ok_or(OverlayError::NotInTree(tree.id()))
    }

    /// Close every host that is still open.
    pub async fn close_all(&mut self) {
        for host in self.hosts.drain(..) {
            if !host.is_closed() {
                if let Err(e) = host.close().await {
                    tracing::debug!("closing {}: {e}", host.identity());
                }
            }
        }
    }
}
