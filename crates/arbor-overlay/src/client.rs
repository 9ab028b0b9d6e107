use arbor_transport::{Keypair, Message, SecureHost, ServerIdentity, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::messages::{ClientRequest, StatusRet};
use crate::{OverlayError, Registry};

/// Talks to one service on any host, request by request.
///
/// Uses a throwaway identity and only dials out. Requests are sent one at
/// a time; each waits for its reply on the same connection. Reply types
/// must be registered in the registry the client is built with.
pub struct Client {
    service: String,
    transport: Arc<SecureHost>,
    timeout: Duration,
    in_flight: Mutex<()>,
}

impl Client {
    pub fn new(service: &str, registry: Arc<Registry>) -> Self {
        Self {
            service: service.to_string(),
            transport: SecureHost::dialer(
                Keypair::generate(),
                registry.messages().clone(),
                TransportConfig::new(),
            ),
            timeout: Duration::from_secs(30),
            in_flight: Mutex::new(()),
        }
    }

    /// How long to wait for a reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `req` to the service on `dst` and wait for a `Rep`.
    ///
    /// An error reported by the service comes back as
    /// [`OverlayError::Status`].
    pub async fn send<Req: Message, Rep: Message>(
        &self,
        dst: &ServerIdentity,
        req: &Req,
    ) -> Result<Rep, OverlayError> {
        let _guard = self.in_flight.lock().await;
        let request = ClientRequest::new(&self.service, req)?;
        let conn = self.transport.open(dst).await?;
        conn.send(&request).await?;

        let packet = match tokio::time::timeout(self.timeout, conn.receive()).await {
            Ok(received) => received?,
            Err(_) => {
                // A late reply must not be taken for the next request's.
                self.transport.remove_connection(&dst.id()).await;
                return Err(OverlayError::Protocol(format!(
                    "no reply from {dst} within {:?}",
                    self.timeout
                )));
            }
        };
        let packet = match packet.downcast::<StatusRet>() {
            Ok((_, status)) => return Err(OverlayError::Status(status.error)),
            Err(packet) => packet,
        };
        packet
            .downcast::<Rep>()
            .map(|(_, reply)| reply)
            .map_err(|p| OverlayError::UnexpectedReply(format!("{:?}", p.msg_type)))
    }

    pub async fn close(&self) -> Result<(), OverlayError> {
        Ok(self.transport.close().await?)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.service)
            .field("identity", self.transport.identity())
            .finish()
    }
}
