use arbor_transport::{Message, MessageRegistry, MessageTypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::messages::{ClientRequest, ProtocolMsg, RequestTree, SendTree, StatusRet};
use crate::protocols::{CloseAllProtocol, CountProtocol};
use crate::service::{Context, Service};
use crate::{OverlayError, ProtocolId, ProtocolInstance, TreeNodeInstance};

/// Builds a protocol instance for a freshly created tree node.
pub type ProtocolConstructor =
    Arc<dyn Fn(TreeNodeInstance) -> Result<Box<dyn ProtocolInstance>, OverlayError> + Send + Sync>;

/// Builds the per-host instance of a service.
pub type ServiceFactory = Arc<dyn Fn(Context) -> Result<Arc<dyn Service>, OverlayError> + Send + Sync>;

#[derive(Clone)]
struct ProtocolEntry {
    name: String,
    ctor: ProtocolConstructor,
}

/// Everything a host needs to know before it starts: message types,
/// protocol constructors and service factories.
///
/// Built once and shared behind an `Arc`. Two registries never see each
/// other's entries, so tests can run several isolated setups in one
/// process.
#[derive(Clone)]
pub struct Registry {
    messages: Arc<MessageRegistry>,
    protocols: HashMap<ProtocolId, ProtocolEntry>,
    services: BTreeMap<String, ServiceFactory>,
}

impl Registry {
    /// Registry with the overlay's own wire messages.
    pub fn new() -> Result<Self, OverlayError> {
        let mut messages = MessageRegistry::new();
        messages.register::<ProtocolMsg>()?;
        messages.register::<RequestTree>()?;
        messages.register::<SendTree>()?;
        messages.register::<ClientRequest>()?;
        messages.register::<StatusRet>()?;
        Ok(Self {
            messages: Arc::new(messages),
            protocols: HashMap::new(),
            services: BTreeMap::new(),
        })
    }

    /// Registry with the overlay messages plus the built-in `Count` and
    /// `CloseAll` protocols.
    pub fn with_builtin_protocols() -> Result<Self, OverlayError> {
        let mut reg = Self::new()?;
        CountProtocol::register(&mut reg)?;
        CloseAllProtocol::register(&mut reg)?;
        Ok(reg)
    }

    /// Register a message type. Idempotent for the same type.
    pub fn register_message<M: Message>(&mut self) -> Result<MessageTypeId, OverlayError> {
        Ok(Arc::make_mut(&mut self.messages).register::<M>()?)
    }

    /// Register a protocol under `name`. Incoming messages for an unknown
    /// token of this protocol create instances through `ctor`.
    pub fn register_protocol<F>(&mut self, name: &str, ctor: F) -> Result<ProtocolId, OverlayError>
    where
        F: Fn(TreeNodeInstance) -> Result<Box<dyn ProtocolInstance>, OverlayError>
            + Send
            + Sync
            + 'static,
    {
        let id = ProtocolId::from_name(name);
        if self.protocols.contains_key(&id) {
            return Err(OverlayError::DuplicateRegistration {
                what: format!("protocol {name}"),
            });
        }
        self.protocols.insert(
            id,
            ProtocolEntry {
                name: name.to_string(),
                ctor: Arc::new(ctor),
            },
        );
        Ok(id)
    }

    /// Register a service. Every host built from this registry starts one
    /// instance of it.
    pub fn register_service<F>(&mut self, name: &str, factory: F) -> Result<(), OverlayError>
    where
        F: Fn(Context) -> Result<Arc<dyn Service>, OverlayError> + Send + Sync + 'static,
    {
        if self.services.contains_key(name) {
            return Err(OverlayError::DuplicateRegistration {
                what: format!("service {name}"),
            });
        }
        self.services.insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn messages(&self) -> &Arc<MessageRegistry> {
        &self.messages
    }

    pub fn protocol_id(&self, name: &str) -> Option<ProtocolId> {
        let id = ProtocolId::from_name(name);
        self.protocols.contains_key(&id).then_some(id)
    }

    pub fn protocol_name(&self, id: &ProtocolId) -> Option<&str> {
        self.protocols.get(id).map(|e| e.name.as_str())
    }

    pub(crate) fn protocol(&self, id: &ProtocolId) -> Option<&ProtocolConstructor> {
        self.protocols.get(id).map(|e| &e.ctor)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub(crate) fn services(&self) -> impl Iterator<Item = (&String, &ServiceFactory)> {
        self.services.iter()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.protocols.values().map(|e| e.name.as_str()).collect();
        protocols.sort_unstable();
        f.debug_struct("Registry")
            .field("messages", &self.messages)
            .field("protocols", &protocols)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}
