use arbor_metrics::Traffic;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::frame::{self, Handshaked};
use crate::{
    Keypair, Message, MessageRegistry, MessageTypeId, SecureConn, ServerId, ServerIdentity,
    TransportConfig, TransportError,
};

/// Callback invoked with every newly authenticated connection, inbound or
/// outbound. It runs on the task that completed the handshake and must not
/// block.
pub type OnConnect = Arc<dyn Fn(Arc<SecureConn>) + Send + Sync>;

/// One server's end of the secure transport.
///
/// Accepts authenticated connections on its listening address and keeps a
/// pool of live connections keyed by remote [`ServerId`], so the first
/// `open` towards a peer dials and later ones reuse the connection.
/// Connections accepted from a peer are pooled too, which lets replies
/// travel back on the connection the request came in on.
pub struct SecureHost {
    keypair: Keypair,
    identity: ServerIdentity,
    registry: Arc<MessageRegistry>,
    config: TransportConfig,
    listener: StdMutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
    on_connect: StdMutex<Option<OnConnect>>,
    connections: Mutex<HashMap<ServerId, Arc<SecureConn>>>,
    /// One dial at a time per peer. The pool lock is never held across a
    /// dial.
    dials: StdMutex<HashMap<ServerId, Arc<Mutex<()>>>>,
    traffic: Arc<Traffic>,
    shutdown: CancellationToken,
}

impl SecureHost {
    /// Bind a listening socket on `addr`.
    ///
    /// The identity announces the address actually bound, so `127.0.0.1:0`
    /// yields a reachable ephemeral port.
    pub async fn bind(
        keypair: Keypair,
        addr: &str,
        registry: Arc<MessageRegistry>,
        config: TransportConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let identity = ServerIdentity::new(keypair.public(), vec![local_addr.to_string()]);
        tracing::debug!("transport bound on {local_addr}");

        Ok(Arc::new(Self::build(
            keypair,
            identity,
            registry,
            config,
            Some(listener),
            Some(local_addr),
        )))
    }

    /// A host that only dials out. Its identity carries no address.
    pub fn dialer(
        keypair: Keypair,
        registry: Arc<MessageRegistry>,
        config: TransportConfig,
    ) -> Arc<Self> {
        let identity = ServerIdentity::new(keypair.public(), Vec::new());
        Arc::new(Self::build(keypair, identity, registry, config, None, None))
    }

    fn build(
        keypair: Keypair,
        identity: ServerIdentity,
        registry: Arc<MessageRegistry>,
        config: TransportConfig,
        listener: Option<TcpListener>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            keypair,
            identity,
            registry,
            config,
            listener: StdMutex::new(listener),
            local_addr,
            on_connect: StdMutex::new(None),
            connections: Mutex::new(HashMap::new()),
            dials: StdMutex::new(HashMap::new()),
            traffic: Arc::new(Traffic::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Start accepting connections.
    ///
    /// `on_connect` is called for every authenticated inbound connection and
    /// for every outbound connection opened afterwards. Can only be called
    /// once; a dialer has nothing to listen on.
    pub fn listen(self: &Arc<Self>, on_connect: OnConnect) -> Result<(), TransportError> {
        let listener = {
            let mut slot = self
                .listener
                .lock()
                .map_err(|_| TransportError::AlreadyListening)?;
            match slot.take() {
                Some(listener) => listener,
                None if self.local_addr.is_none() => {
                    return Err(TransportError::NoAddress(self.identity.id()))
                }
                None => return Err(TransportError::AlreadyListening),
            }
        };
        if let Ok(mut slot) = self.on_connect.lock() {
            *slot = Some(on_connect);
        }

        let host = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = host.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::debug!("accept failed: {e}");
                            continue;
                        }
                    },
                };
                let host = Arc::clone(&host);
                tokio::spawn(async move {
                    match host.accept(stream).await {
                        Ok(conn) => host.notify(conn),
                        Err(e) => tracing::debug!("rejected connection from {peer}: {e}"),
                    }
                });
            }
            tracing::debug!("listener on {} stopped", host.identity);
        });
        Ok(())
    }

    async fn accept(&self, mut stream: TcpStream) -> Result<Arc<SecureConn>, TransportError> {
        let _ = stream.set_nodelay(true);
        let handshaked = tokio::time::timeout(
            self.config.handshake_timeout,
            frame::handshake(
                &mut stream,
                &self.keypair,
                &self.identity,
                None,
                self.config.max_message_size,
            ),
        )
        .await
        .map_err(|_| TransportError::Handshake {
            peer: "inbound".into(),
            reason: "timed out".into(),
        })??;

        let conn = self.wrap(stream, handshaked);
        let mut conns = self.connections.lock().await;
        let replace = match conns.get(&conn.remote().id()) {
            Some(existing) => existing.is_closed(),
            None => true,
        };
        if replace {
            conns.insert(conn.remote().id(), Arc::clone(&conn));
        }
        Ok(conn)
    }

    fn wrap(&self, stream: TcpStream, handshaked: Handshaked) -> Arc<SecureConn> {
        let conn = SecureConn::new(
            stream,
            handshaked.remote,
            Arc::clone(&self.registry),
            Traffic::child_of(Arc::clone(&self.traffic)),
            self.shutdown.child_token(),
            self.config.max_message_size,
        );
        conn.record_handshake(handshaked.tx, handshaked.rx);
        Arc::new(conn)
    }

    fn notify(&self, conn: Arc<SecureConn>) {
        let callback = match self.on_connect.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(conn);
        }
    }

    /// Get a live connection to `to`, dialing its addresses in order if
    /// there is none yet.
    ///
    /// Dialing one peer does not hold up sends to the others.
    pub async fn open(&self, to: &ServerIdentity) -> Result<Arc<SecureConn>, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if let Some(conn) = self.live(&to.id()).await {
            return Ok(conn);
        }

        let gate = self.dial_gate(&to.id());
        let _dialing = gate.lock().await;
        // Someone else may have connected while we waited.
        if let Some(conn) = self.live(&to.id()).await {
            return Ok(conn);
        }

        let mut last_err = TransportError::NoAddress(to.id());
        for addr in to.addresses() {
            match self.dial(addr, to).await {
                Ok(conn) => return self.pool(conn).await,
                Err(e) => {
                    tracing::debug!("dial {addr} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// The pooled connection to `id` if it is still open. A closed one is
    /// evicted.
    async fn live(&self, id: &ServerId) -> Option<Arc<SecureConn>> {
        let mut conns = self.connections.lock().await;
        match conns.get(id) {
            Some(conn) if !conn.is_closed() => Some(Arc::clone(conn)),
            Some(_) => {
                conns.remove(id);
                None
            }
            None => None,
        }
    }

    fn dial_gate(&self, id: &ServerId) -> Arc<Mutex<()>> {
        let mut dials = self.dials.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(dials.entry(*id).or_default())
    }

    /// Pool a freshly dialed connection. An inbound connection from the
    /// same peer that was accepted meanwhile wins and ours is closed.
    async fn pool(&self, conn: Arc<SecureConn>) -> Result<Arc<SecureConn>, TransportError> {
        let id = conn.remote().id();
        let mut conns = self.connections.lock().await;
        if self.shutdown.is_cancelled() {
            drop(conns);
            let _ = conn.close().await;
            return Err(TransportError::Closed);
        }
        if let Some(existing) = conns.get(&id).filter(|c| !c.is_closed()).cloned() {
            drop(conns);
            let _ = conn.close().await;
            return Ok(existing);
        }
        conns.insert(id, Arc::clone(&conn));
        drop(conns);
        self.notify(Arc::clone(&conn));
        Ok(conn)
    }

    async fn dial(
        &self,
        addr: &str,
        to: &ServerIdentity,
    ) -> Result<Arc<SecureConn>, TransportError> {
        let attempt = async {
            let mut stream =
                TcpStream::connect(addr)
                    .await
                    .map_err(|source| TransportError::Connect {
                        address: addr.to_string(),
                        source,
                    })?;
            let _ = stream.set_nodelay(true);
            let handshaked = frame::handshake(
                &mut stream,
                &self.keypair,
                &self.identity,
                Some(to),
                self.config.max_message_size,
            )
            .await?;
            Ok::<_, TransportError>((stream, handshaked))
        };

        let (stream, handshaked) = tokio::time::timeout(self.config.handshake_timeout, attempt)
            .await
            .map_err(|_| TransportError::Handshake {
                peer: addr.to_string(),
                reason: "timed out".into(),
            })??;
        Ok(self.wrap(stream, handshaked))
    }

    /// Send `msg` to `to`, opening a connection if needed.
    ///
    /// A connection that fails to carry the message is evicted from the
    /// pool so the next send dials afresh.
    pub async fn send<M: Message>(
        &self,
        to: &ServerIdentity,
        msg: &M,
    ) -> Result<(), TransportError> {
        let (msg_type, payload) = self.registry.encode(msg)?;
        self.send_raw(to, msg_type, &payload).await
    }

    pub async fn send_raw(
        &self,
        to: &ServerIdentity,
        msg_type: MessageTypeId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let conn = self.open(to).await?;
        match conn.send_raw(msg_type, payload).await {
            Ok(()) => Ok(()),
            Err(e @ TransportError::MessageTooLarge { .. }) => Err(e),
            Err(e) => {
                self.remove_connection(&to.id()).await;
                Err(e)
            }
        }
    }

    /// The pooled connection to `id`, if any.
    pub async fn connection(&self, id: &ServerId) -> Option<Arc<SecureConn>> {
        self.connections.lock().await.get(id).cloned()
    }

    /// Drop `id` from the pool and close its connection.
    pub async fn remove_connection(&self, id: &ServerId) {
        let removed = self.connections.lock().await.remove(id);
        if let Some(conn) = removed {
            let _ = conn.close().await;
        }
    }

    /// Number of live pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Close the listener and every connection.
    ///
    /// Every pending `receive` on this host's connections returns `Closed`.
    /// Closing twice returns `AlreadyClosed`.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }

        let conns: Vec<_> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in conns {
            let _ = conn.close().await;
        }
        // Unpooled connections are children of this token.
        self.shutdown.cancel();
        tracing::debug!("transport {} closed", self.identity);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Total bytes sent by all connections of this host.
    pub fn tx(&self) -> u64 {
        self.traffic.tx()
    }

    /// Total bytes received by all connections of this host.
    pub fn rx(&self) -> u64 {
        self.traffic.rx()
    }
}

impl fmt::Debug for SecureHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureHost")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .field("traffic", &self.traffic)
            .finish_non_exhaustive()
    }
}
