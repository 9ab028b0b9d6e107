use arbor_metrics::Traffic;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::frame;
use crate::{Message, MessageRegistry, MessageTypeId, Packet, ServerIdentity, TransportError};

/// An authenticated connection to one remote server.
///
/// Sends and receives may run concurrently from different tasks; sends
/// are serialized among themselves, as are receives, so frames from one
/// sender arrive in order. Closing cancels any pending `receive`.
pub struct SecureConn {
    remote: ServerIdentity,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    registry: Arc<MessageRegistry>,
    traffic: Traffic,
    closed: CancellationToken,
    max_message_size: usize,
}

impl SecureConn {
    pub(crate) fn new(
        stream: TcpStream,
        remote: ServerIdentity,
        registry: Arc<MessageRegistry>,
        traffic: Traffic,
        closed: CancellationToken,
        max_message_size: usize,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            remote,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            registry,
            traffic,
            closed,
            max_message_size,
        }
    }

    pub(crate) fn record_handshake(&self, tx: usize, rx: usize) {
        self.traffic.record_tx(tx as u64);
        self.traffic.record_rx(rx as u64);
    }

    /// The authenticated remote identity.
    pub fn remote(&self) -> &ServerIdentity {
        &self.remote
    }

    /// Encode and send a registered message.
    pub async fn send<M: Message>(&self, msg: &M) -> Result<(), TransportError> {
        let (msg_type, payload) = self.registry.encode(msg)?;
        self.send_raw(msg_type, &payload).await
    }

    /// Send an already encoded payload under `msg_type`.
    pub async fn send_raw(
        &self,
        msg_type: MessageTypeId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            r = frame::write_frame(&mut *writer, &msg_type, payload, self.max_message_size) => r,
        };
        match result {
            Ok(n) => {
                self.traffic.record_tx(n as u64);
                Ok(())
            }
            Err(e @ TransportError::MessageTooLarge { .. }) => Err(e),
            Err(e) => {
                self.closed.cancel();
                Err(e)
            }
        }
    }

    /// Wait for the next complete message.
    ///
    /// Fails with `Closed` once the connection is closed from either side.
    /// A frame that cannot be decoded tears the connection down.
    pub async fn receive(&self) -> Result<Packet, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            r = frame::read_frame(&mut *reader, self.max_message_size) => r,
        };
        let (msg_type, payload, n) = match result {
            Ok(frame) => frame,
            Err(e) => {
                self.closed.cancel();
                return Err(e);
            }
        };
        self.traffic.record_rx(n as u64);

        match self.registry.decode(&msg_type, &payload) {
            Ok(msg) => Ok(Packet {
                from: self.remote.clone(),
                msg_type,
                msg,
            }),
            Err(e) => {
                tracing::warn!("closing connection to {}: {e}", self.remote);
                self.closed.cancel();
                Err(e)
            }
        }
    }

    /// Close the connection. A second close returns `AlreadyClosed`.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::AlreadyClosed);
        }
        self.closed.cancel();
        // Pending writers leave on cancellation, so the lock frees up.
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Bytes sent on this connection, handshake included.
    pub fn tx(&self) -> u64 {
        self.traffic.tx()
    }

    /// Bytes received on this connection, handshake included.
    pub fn rx(&self) -> u64 {
        self.traffic.rx()
    }
}

impl fmt::Debug for SecureConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConn")
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .field("traffic", &self.traffic)
            .finish()
    }
}
