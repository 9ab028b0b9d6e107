/// Long-lived, per-host services.
///
/// Every service registered in the [`Registry`](crate::Registry) gets one
/// instance per host, built when the host starts. A service answers
/// client requests, may build the protocol instances for tokens carrying
/// its id, and may claim raw message types sent host-to-host.
use arbor_transport::{Message, MessageRegistry, MessageTypeId, Packet, ServerIdentity};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::host::HostInner;
use crate::messages::{ClientRequest, StatusRet};
use crate::{
    Host, HostStatus, OverlayError, ProtocolInstance, ServiceId, Token, Tree, TreeNodeInstance,
};

/// Encoded reply to a client request.
pub type Reply = (MessageTypeId, Vec<u8>);

#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Answer a request from a client. An error goes back to the client
    /// as a `StatusRet`.
    async fn process_client_request(
        &self,
        from: &ServerIdentity,
        req: ClientRequest,
    ) -> Result<Reply, OverlayError> {
        let _ = from;
        Err(OverlayError::UnexpectedReply(format!(
            "service takes no request of type {}",
            req.msg_type
        )))
    }

    /// Build the instance for an incoming token that names this service.
    /// `Ok(None)` falls back to the protocol's registered constructor.
    fn new_protocol(
        &self,
        node: TreeNodeInstance,
    ) -> Result<Option<Box<dyn ProtocolInstance>>, OverlayError> {
        let _ = node;
        Ok(None)
    }

    /// A message of a type claimed with [`Context::register_processor`].
    async fn process(&self, packet: Packet) {
        tracing::debug!("unhandled {:?}", packet);
    }

    fn status(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

// ── Manager ───────────────────────────────────────────────────────────

struct ServiceEntry {
    name: String,
    id: ServiceId,
    service: Arc<dyn Service>,
}

#[derive(Default)]
pub(crate) struct ServiceManager {
    entries: RwLock<Vec<ServiceEntry>>,
    processors: Mutex<HashMap<MessageTypeId, ServiceId>>,
}

impl ServiceManager {
    pub(crate) fn insert(&self, name: &str, service: Arc<dyn Service>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(ServiceEntry {
            name: name.to_string(),
            id: ServiceId::from_name(name),
            service,
        });
    }

    pub(crate) fn by_id(&self, id: &ServiceId) -> Option<Arc<dyn Service>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().find(|e| e.id == *id).map(|e| e.service.clone())
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<dyn Service>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().find(|e| e.name == name).map(|e| e.service.clone())
    }

    pub(crate) fn register_processor(
        &self,
        msg_type: MessageTypeId,
        service: ServiceId,
    ) -> Result<(), OverlayError> {
        let mut processors = self.processors.lock().unwrap_or_else(PoisonError::into_inner);
        if processors.contains_key(&msg_type) {
            return Err(OverlayError::DuplicateRegistration {
                what: format!("processor for {msg_type}"),
            });
        }
        processors.insert(msg_type, service);
        Ok(())
    }

    pub(crate) fn processor_for(&self, msg_type: &MessageTypeId) -> Option<Arc<dyn Service>> {
        let id = *self
            .processors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg_type)?;
        self.by_id(&id)
    }

    pub(crate) fn new_protocol(
        &self,
        id: &ServiceId,
        node: TreeNodeInstance,
    ) -> Result<Option<Box<dyn ProtocolInstance>>, OverlayError> {
        let service = self
            .by_id(id)
            .ok_or_else(|| OverlayError::ServiceNotFound(format!("{id:?}")))?;
        service.new_protocol(node)
    }

    pub(crate) fn statuses(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|e| (e.name.clone(), e.service.status()))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.processors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ── Context ───────────────────────────────────────────────────────────

/// A service's view of its host.
#[derive(Clone)]
pub struct Context {
    host: Weak<HostInner>,
    service_id: ServiceId,
    name: String,
    identity: ServerIdentity,
    messages: Arc<MessageRegistry>,
}

impl Context {
    pub(crate) fn new(
        host: Weak<HostInner>,
        name: &str,
        identity: ServerIdentity,
        messages: Arc<MessageRegistry>,
    ) -> Self {
        Self {
            host,
            service_id: ServiceId::from_name(name),
            name: name.to_string(),
            identity,
            messages,
        }
    }

    fn host(&self) -> Result<Host, OverlayError> {
        self.host
            .upgrade()
            .map(Host::from_inner)
            .ok_or(OverlayError::HostClosed)
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn messages(&self) -> &Arc<MessageRegistry> {
        &self.messages
    }

    /// A fresh, unbound node of `protocol` on `tree`, tagged with this
    /// service. Bind a protocol instance to it with
    /// [`register_protocol_instance`](Self::register_protocol_instance).
    pub fn new_tree_node_instance(
        &self,
        tree: &Arc<Tree>,
        protocol: &str,
    ) -> Result<TreeNodeInstance, OverlayError> {
        self.host()?
            .new_tree_node_instance(tree, protocol, Some(self.service_id))
    }

    /// The live node for `token`, if any.
    pub fn tree_node_instance(&self, token: &Token) -> Option<TreeNodeInstance> {
        self.host().ok()?.tree_node_instance(token)
    }

    /// Instantiate `protocol` on `tree` through its registered
    /// constructor, tagged with this service. The instance is bound.
    pub fn create_protocol(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
    ) -> Result<Box<dyn ProtocolInstance>, OverlayError> {
        self.host()?
            .create_protocol_for_service(protocol, tree, self.service_id)
    }

    /// Like [`create_protocol`](Self::create_protocol), tagged with the
    /// service registered as `service` instead of this one.
    pub fn create_protocol_for_service(
        &self,
        protocol: &str,
        tree: &Arc<Tree>,
        service: &str,
    ) -> Result<Box<dyn ProtocolInstance>, OverlayError> {
        self.host()?
            .create_protocol_for_service(protocol, tree, ServiceId::from_name(service))
    }

    /// Bind `p` to its node's token. Fails with `AlreadyBound` if the
    /// token already has an instance or has finished.
    pub fn register_protocol_instance(&self, p: &dyn ProtocolInstance) -> Result<(), OverlayError> {
        self.host()?.bind_instance(&p.node().token())
    }

    pub async fn start_protocol(&self, p: Box<dyn ProtocolInstance>) -> Result<(), OverlayError> {
        self.host()?.start_protocol(p).await
    }

    /// Send `msg` straight to another host, outside any tree.
    pub async fn send_raw<M: Message>(&self, to: &ServerIdentity, msg: &M) -> Result<(), OverlayError> {
        self.host()?.send_raw(to, msg).await
    }

    /// Route every incoming `M` on this host to this service's
    /// [`Service::process`].
    pub fn register_processor<M: Message>(&self) -> Result<(), OverlayError> {
        let msg_type = MessageTypeId::of::<M>();
        if !self.messages.is_registered(&msg_type) {
            return Err(OverlayError::UnregisteredMessage(M::NAME.to_string()));
        }
        self.host()?.register_processor(msg_type, self.service_id)
    }

    pub async fn report_status(&self) -> Result<HostStatus, OverlayError> {
        Ok(self.host()?.status().await)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("service", &self.name)
            .field("server", &self.identity)
            .finish()
    }
}

// ── Request processor ─────────────────────────────────────────────────

type RequestHandler =
    Box<dyn Fn(&ServerIdentity, &[u8]) -> Result<Reply, OverlayError> + Send + Sync>;

/// Typed dispatch of client requests, for services to embed.
///
/// ```ignore
/// let mut processor = ServiceProcessor::new();
/// processor.register_request(|_from, req: Echo| Ok(Echo { text: req.text }))?;
/// ```
#[derive(Default)]
pub struct ServiceProcessor {
    handlers: HashMap<MessageTypeId, RequestHandler>,
}

impl ServiceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests of type `Req` with `f`. The reply type must be
    /// registered on the client's side.
    pub fn register_request<Req, Rep, F>(&mut self, f: F) -> Result<(), OverlayError>
    where
        Req: Message,
        Rep: Message,
        F: Fn(&ServerIdentity, Req) -> Result<Rep, OverlayError> + Send + Sync + 'static,
    {
        let msg_type = MessageTypeId::of::<Req>();
        if self.handlers.contains_key(&msg_type) {
            return Err(OverlayError::DuplicateRegistration {
                what: format!("request handler for {}", Req::NAME),
            });
        }
        self.handlers.insert(
            msg_type,
            Box::new(move |from, data| {
                let req: Req = rmp_serde::from_slice(data)?;
                let reply = f(from, req)?;
                Ok((MessageTypeId::of::<Rep>(), rmp_serde::to_vec(&reply)?))
            }),
        );
        Ok(())
    }

    pub fn process_client_request(
        &self,
        from: &ServerIdentity,
        req: &ClientRequest,
    ) -> Result<Reply, OverlayError> {
        let handler = self
            .handlers
            .get(&req.msg_type)
            .ok_or_else(|| OverlayError::UnregisteredMessage(req.msg_type.to_string()))?;
        handler(from, &req.data)
    }

    /// Like [`process_client_request`](Self::process_client_request), but
    /// a failed request becomes a [`StatusRet`] reply carrying the error.
    pub fn reply(&self, from: &ServerIdentity, req: &ClientRequest) -> Result<Reply, OverlayError> {
        match self.process_client_request(from, req) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let status = StatusRet { error: e.to_string() };
                Ok((MessageTypeId::of::<StatusRet>(), rmp_serde::to_vec(&status)?))
            }
        }
    }
}

impl fmt::Debug for ServiceProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProcessor")
            .field("requests", &self.handlers.len())
            .finish()
    }
}
