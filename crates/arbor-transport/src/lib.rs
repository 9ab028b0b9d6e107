//! arbor transport layer.
//!
//! Authenticated, typed, length-framed TCP connections between server
//! identities. Each connection starts with a mutual Ed25519 handshake;
//! afterwards every frame carries a [`MessageTypeId`] that the receiving
//! [`MessageRegistry`] decodes back into the concrete message type.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arbor_transport::{Keypair, Message, MessageRegistry, SecureConn, SecureHost, TransportConfig};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping(u32);
//!
//! impl Message for Ping {
//!     const NAME: &'static str = "demo.Ping";
//! }
//!
//! # async fn example() -> Result<(), arbor_transport::TransportError> {
//! let mut registry = MessageRegistry::new();
//! registry.register::<Ping>()?;
//! let registry = Arc::new(registry);
//!
//! let server = SecureHost::bind(Keypair::generate(), "127.0.0.1:0", registry.clone(), TransportConfig::new()).await?;
//! server.listen(Arc::new(|conn: Arc<SecureConn>| {
//!     tokio::spawn(async move {
//!         while let Ok(packet) = conn.receive().await {
//!             tracing::info!("got {:?}", packet.msg_ref::<Ping>().map(|p| p.0));
//!         }
//!     });
//! }))?;
//!
//! let client = SecureHost::dialer(Keypair::generate(), registry, TransportConfig::new());
//! client.send(server.identity(), &Ping(1)).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod conn;
mod error;
mod frame;
mod host;
mod identity;
mod message;

pub use config::TransportConfig;
pub use conn::SecureConn;
pub use error::TransportError;
pub use host::{OnConnect, SecureHost};
pub use identity::{Keypair, PublicKey, ServerId, ServerIdentity};
pub use message::{AnyMessage, Message, MessageRegistry, MessageTypeId, Packet};
