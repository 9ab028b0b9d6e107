/// A server of the overlay: transport, routing task, overlay state and
/// services bundled together.
///
/// Every connection gets a reader task that pushes decoded packets into
/// one bounded inbound queue. A single routing task drains it and hands
/// each packet to the overlay, a service or the tree exchange. Routing
/// never waits on a protocol instance: messages go into instance
/// mailboxes with `try_send`.
use arbor_transport::{
    Keypair, Message, MessageTypeId, OnConnect, Packet, SecureConn, SecureHost, ServerIdentity,
    TransportError,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::{ClientRequest, ProtocolMsg, RequestTree, SendTree, StatusRet};
use crate::overlay::{Overlay, Resolution};
use crate::service::{Context, Service, ServiceManager};
use crate::{
    downcast_protocol, HostConfig, OverlayError, ProtocolInstance, Registry, Roster, RosterId,
    ServiceId, Token, Tree, TreeId, TreeNodeInstance,
};

pub(crate) struct HostInner {
    transport: Arc<SecureHost>,
    overlay: Overlay,
    services: ServiceManager,
    registry: Arc<Registry>,
    inbound_tx: mpsc::Sender<Packet>,
    closing: AtomicBool,
    closed: CancellationToken,
}

/// Snapshot of a host, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub address: Option<String>,
    pub connections: usize,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub instances: usize,
    pub trees: usize,
    pub rosters: usize,
    pub services: BTreeMap<String, BTreeMap<String, String>>,
    pub closed: bool,
}

/// Handle to a running host. Clones share the host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Bind on `addr`, start one instance of every registered service and
    /// begin accepting connections.
    ///
    /// A failing service factory aborts the start; the host is closed and
    /// the error returned.
    pub async fn bind(
        keypair: Keypair,
        addr: &str,
        registry: Arc<Registry>,
        config: HostConfig,
    ) -> Result<Host, OverlayError> {
        let transport = SecureHost::bind(
            keypair,
            addr,
            registry.messages().clone(),
            config.transport.clone(),
        )
        .await?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let closed = CancellationToken::new();
        let overlay = Overlay::new(transport.identity().id(), registry.messages().clone(), &config);
        let host = Host {
            inner: Arc::new(HostInner {
                transport: transport.clone(),
                overlay,
                services: ServiceManager::default(),
                registry,
                inbound_tx: inbound_tx.clone(),
                closing: AtomicBool::new(false),
                closed: closed.clone(),
            }),
        };

        if let Err(e) = host.start_services() {
            tracing::warn!("host {}: service failed to start: {e}", host.identity());
            let _ = host.close().await;
            return Err(e);
        }

        let on_connect: OnConnect = Arc::new(move |conn: Arc<SecureConn>| {
            tokio::spawn(read_loop(conn, inbound_tx.clone(), closed.clone()));
        });
        if let Err(e) = transport.listen(on_connect) {
            let _ = host.close().await;
            return Err(e.into());
        }
        tokio::spawn(route_loop(host.inner.clone(), inbound_rx));

        tracing::info!("host {} up", host.identity());
        Ok(host)
    }

    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Host {
        Host { inner }
    }

    fn start_services(&self) -> Result<(), OverlayError> {
        for (name, factory) in self.inner.registry.services() {
            let ctx = Context::new(
                Arc::downgrade(&self.inner),
                name,
                self.identity().clone(),
                self.inner.registry.messages().clone(),
            );
            let service = factory(ctx)?;
            self.inner.services.insert(name, service);
            tracing::debug!("host {}: started service {name}", self.identity());
        }
        Ok(())
    }

    pub fn identity(&self) -> &ServerIdentity {
        self.inner.transport.identity()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    // ── Trees and rosters ─────────────────────────────────────────────

    pub fn register_roster(&self, roster: Arc<Roster>) {
        self.inner.overlay.register_roster(roster);
    }

    /// Make `tree` known locally. Messages that were waiting for it are
    /// delivered.
    pub fn register_tree(&self, tree: Arc<Tree>) {
        for (from, pm) in self.inner.overlay.register_tree(tree) {
            self.inner.process_protocol_msg(from, pm);
        }
    }

    pub fn tree(&self, id: &TreeId) -> Option<Arc<Tree>> {
        self.inner.overlay.tree(id)
    }

    pub fn roster(&self, id: &RosterId) -> Option<Arc<Roster>> {
        self.inner.overlay.roster(id)
    }

    // ── Protocols ─────────────────────────────────────────────────────

    /// Instantiate `protocol` on `tree`, on the root if this host holds
    /// it. The instance is bound to a fresh token but not started.
    pub fn create_protocol(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
    ) -> Result<Box<dyn ProtocolInstance>, OverlayError> {
        self.create_protocol_inner(protocol, tree, None)
    }

    /// Like [`create_protocol`](Self::create_protocol), with the concrete
    /// type back.
    pub fn create_protocol_typed<P: ProtocolInstance>(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
    ) -> Result<Box<P>, OverlayError> {
        downcast_protocol::<P>(self.create_protocol(protocol, tree)?)
    }

    /// Like [`create_protocol`](Self::create_protocol), with the token
    /// tagged for `service`. Remote nodes of the run are built by that
    /// service's [`Service::new_protocol`] when it provides one.
    pub fn create_protocol_for_service(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
        service: ServiceId,
    ) -> Result<Box<dyn ProtocolInstance>, OverlayError> {
        self.create_protocol_inner(protocol, tree, Some(service))
    }

    fn create_protocol_inner(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
        service: Option<ServiceId>,
    ) -> Result<Box<dyn ProtocolInstance>, OverlayError> {
        let proto_id = self
            .inner
            .registry
            .protocol_id(protocol)
            .ok_or_else(|| OverlayError::UnknownProtocol(protocol.to_string()))?;
        let ctor = self
            .inner
            .registry
            .protocol(&proto_id)
            .ok_or_else(|| OverlayError::UnknownProtocol(protocol.to_string()))?
            .clone();
        let node = self.new_tree_node_instance(tree, protocol, service)?;
        let token = node.token();
        let p = match ctor(node) {
            Ok(p) => p,
            Err(e) => {
                self.inner.overlay.discard(&token);
                return Err(e);
            }
        };
        if let Err(e) = self.inner.overlay.bind(&token) {
            self.inner.overlay.discard(&token);
            return Err(e);
        }
        Ok(p)
    }

    pub(crate) fn new_tree_node_instance(
        &self,
        tree: &Arc<Tree>,
        protocol: &str,
        service: Option<ServiceId>,
    ) -> Result<TreeNodeInstance, OverlayError> {
        let proto_id = self
            .inner
            .registry
            .protocol_id(protocol)
            .ok_or_else(|| OverlayError::UnknownProtocol(protocol.to_string()))?;
        self.register_tree(tree.clone());
        self.inner
            .overlay
            .new_node(Arc::downgrade(&self.inner), tree.clone(), proto_id, service)
    }

    pub(crate) fn tree_node_instance(&self, token: &Token) -> Option<TreeNodeInstance> {
        self.inner.overlay.node(token)
    }

    pub(crate) fn bind_instance(&self, token: &Token) -> Result<(), OverlayError> {
        self.inner.overlay.bind(token)
    }

    /// Run `start` on the instance, then its dispatch loop in the
    /// background. An error from `start` finishes the instance and is
    /// returned.
    pub async fn start_protocol(&self, mut p: Box<dyn ProtocolInstance>) -> Result<(), OverlayError> {
        if self.is_closed() {
            p.done();
            return Err(OverlayError::HostClosed);
        }
        if let Err(e) = p.start().await {
            tracing::warn!("{}: start failed: {e}", p.node().info());
            p.done();
            return Err(e);
        }
        spawn_instance(p);
        Ok(())
    }

    // ── Services ──────────────────────────────────────────────────────

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.inner.services.by_name(name)
    }

    pub(crate) fn register_processor(
        &self,
        msg_type: MessageTypeId,
        service: ServiceId,
    ) -> Result<(), OverlayError> {
        self.inner.services.register_processor(msg_type, service)
    }

    pub(crate) async fn send_raw<M: Message>(
        &self,
        to: &ServerIdentity,
        msg: &M,
    ) -> Result<(), OverlayError> {
        Ok(self.inner.transport.send(to, msg).await?)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Finish every instance, drop the services and close the transport.
    /// A second close returns `AlreadyClosed`.
    pub async fn close(&self) -> Result<(), OverlayError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyClosed.into());
        }
        self.inner.closed.cancel();
        self.inner.overlay.close_all();
        let result = self.inner.transport.close().await;
        self.inner.services.clear();
        tracing::info!("host {} closed", self.identity());
        match result {
            Ok(()) | Err(TransportError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the host is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub async fn status(&self) -> HostStatus {
        let (instances, trees, rosters) = self.inner.overlay.counts();
        HostStatus {
            address: self.identity().address().map(str::to_string),
            connections: self.inner.transport.connection_count().await,
            tx_bytes: self.inner.transport.tx(),
            rx_bytes: self.inner.transport.rx(),
            instances,
            trees,
            rosters,
            services: self.inner.services.statuses(),
            closed: self.is_closed(),
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("identity", self.identity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Routing ───────────────────────────────────────────────────────────

fn spawn_instance(mut p: Box<dyn ProtocolInstance>) {
    tokio::spawn(async move {
        if let Err(e) = p.dispatch().await {
            tracing::warn!("{}: dispatch ended: {e}", p.node().info());
        }
        p.done();
    });
}

async fn read_loop(conn: Arc<SecureConn>, inbound: mpsc::Sender<Packet>, closed: CancellationToken) {
    loop {
        let packet = tokio::select! {
            _ = closed.cancelled() => return,
            r = conn.receive() => match r {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!("connection to {} ended: {e}", conn.remote());
                    return;
                }
            },
        };
        if inbound.send(packet).await.is_err() {
            return;
        }
    }
}

async fn route_loop(inner: Arc<HostInner>, mut inbound: mpsc::Receiver<Packet>) {
    loop {
        let packet = tokio::select! {
            _ = inner.closed.cancelled() => break,
            p = inbound.recv() => match p {
                Some(p) => p,
                None => break,
            },
        };
        inner.process(packet);
    }
    tracing::debug!("host {}: routing stopped", inner.transport.identity());
}

impl HostInner {
    pub(crate) fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Send `pm` to `to`, looping back through the inbound queue when
    /// `to` is this host.
    pub(crate) async fn deliver(&self, to: &ServerIdentity, pm: ProtocolMsg) -> Result<(), OverlayError> {
        if to.id() == self.transport.identity().id() {
            let packet = Packet {
                from: self.transport.identity().clone(),
                msg_type: MessageTypeId::of::<ProtocolMsg>(),
                msg: Box::new(pm),
            };
            return self
                .inbound_tx
                .send(packet)
                .await
                .map_err(|_| OverlayError::HostClosed);
        }
        Ok(self.transport.send(to, &pm).await?)
    }

    fn process(self: &Arc<Self>, packet: Packet) {
        let packet = match packet.downcast::<ProtocolMsg>() {
            Ok((from, pm)) => return self.process_protocol_msg(from, pm),
            Err(p) => p,
        };
        let packet = match packet.downcast::<RequestTree>() {
            Ok((from, req)) => return self.answer_tree_request(from, req),
            Err(p) => p,
        };
        let packet = match packet.downcast::<SendTree>() {
            Ok((from, st)) => return self.receive_tree(from, st),
            Err(p) => p,
        };
        let packet = match packet.downcast::<ClientRequest>() {
            Ok((from, req)) => {
                let inner = self.clone();
                tokio::spawn(async move { inner.process_client_request(from, req).await });
                return;
            }
            Err(p) => p,
        };
        match self.services.processor_for(&packet.msg_type) {
            Some(service) => {
                tokio::spawn(async move { service.process(packet).await });
            }
            None => tracing::debug!("dropping {packet:?}: nobody processes it"),
        }
    }

    fn process_protocol_msg(self: &Arc<Self>, from: ServerIdentity, pm: ProtocolMsg) {
        let (node, sender, created) = match self.overlay.resolve(&Arc::downgrade(self), &from, &pm) {
            Resolution::Drop(reason) => {
                tracing::debug!("dropping message for {}: {reason}", pm.token);
                return;
            }
            Resolution::Park { request } => {
                if request {
                    self.request_tree(from, pm.token.tree_id);
                }
                return;
            }
            Resolution::Deliver { node, from, created } => (node, from, created),
        };

        if created {
            if let Err(e) = self.instantiate(&node) {
                tracing::warn!("cannot instantiate {}: {e}", node.info());
                self.overlay.discard(&pm.token);
                return;
            }
        }

        let msg = match self.registry.messages().decode(&pm.msg_type, &pm.data) {
            Ok(msg) => msg,
            Err(TransportError::UnknownMessageType(t)) => {
                tracing::debug!("{}: unregistered message type {t}", node.info());
                node.report(OverlayError::NoRoute(t.to_string()));
                return;
            }
            Err(e) => {
                tracing::warn!("{}: undecodable message: {e}", node.info());
                return;
            }
        };
        if let Err(e) = node.route(sender, pm.msg_type, msg) {
            tracing::debug!("{}: {e}", node.info());
        }
    }

    /// Build, bind and spawn the instance for a node created by an
    /// incoming message.
    fn instantiate(&self, node: &TreeNodeInstance) -> Result<(), OverlayError> {
        let token = node.token();
        let built = match token.service_id {
            Some(id) => self.services.new_protocol(&id, node.clone())?,
            None => None,
        };
        let p = match built {
            Some(p) => p,
            None => {
                let ctor = self
                    .registry
                    .protocol(&token.proto_id)
                    .ok_or_else(|| OverlayError::UnknownProtocol(format!("{:?}", token.proto_id)))?;
                ctor(node.clone())?
            }
        };
        if !node.is_bound() {
            self.overlay.bind(&token)?;
        }
        spawn_instance(p);
        Ok(())
    }

    fn request_tree(self: &Arc<Self>, from: ServerIdentity, tree_id: TreeId) {
        let inner = self.clone();
        tokio::spawn(async move {
            tracing::debug!("asking {from} for tree {tree_id:?}");
            if let Err(e) = inner.transport.send(&from, &RequestTree { tree_id }).await {
                tracing::warn!("tree request to {from} failed: {e}");
            }
        });
    }

    fn answer_tree_request(self: &Arc<Self>, from: ServerIdentity, req: RequestTree) {
        let Some(tree) = self.overlay.tree(&req.tree_id) else {
            tracing::debug!("{from} asked for unknown tree {:?}", req.tree_id);
            return;
        };
        let reply = SendTree {
            roster: tree.roster().as_ref().clone(),
            tree: tree.marshal(),
        };
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.transport.send(&from, &reply).await {
                tracing::warn!("sending tree to {from} failed: {e}");
            }
        });
    }

    fn receive_tree(self: &Arc<Self>, from: ServerIdentity, st: SendTree) {
        let roster = Arc::new(st.roster);
        let tree = match Tree::from_marshal(&st.tree, roster) {
            Ok(tree) => Arc::new(tree),
            Err(e) => {
                tracing::warn!("invalid tree from {from}: {e}");
                return;
            }
        };
        tracing::debug!("received tree {:?} from {from}", tree.id());
        for (from, pm) in self.overlay.register_tree(tree) {
            self.process_protocol_msg(from, pm);
        }
    }

    async fn process_client_request(&self, from: ServerIdentity, req: ClientRequest) {
        let reply = match self.services.by_id(&req.service) {
            Some(service) => service.process_client_request(&from, req).await,
            None => Err(OverlayError::ServiceNotFound(format!("{:?}", req.service))),
        };
        let sent = match reply {
            Ok((msg_type, data)) => self.transport.send_raw(&from, msg_type, &data).await,
            Err(e) => {
                tracing::debug!("request from {from} failed: {e}");
                self.transport
                    .send(&from, &StatusRet { error: e.to_string() })
                    .await
            }
        };
        if let Err(e) = sent {
            tracing::debug!("reply to {from} failed: {e}");
        }
    }
}
