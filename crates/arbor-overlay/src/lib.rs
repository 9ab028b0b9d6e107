//! arbor overlay: tree-structured protocol runs over authenticated hosts.
//!
//! A [`Roster`] lists the servers taking part in a run and deterministically
//! yields a [`Tree`]. Protocol instances live on the tree's nodes, one per
//! [`Token`]; a node's instance is created on the first message addressed
//! to its token and talks to its parent and children through its
//! [`TreeNodeInstance`]. Incoming messages reach an instance either on
//! typed channels or through handler methods, one at a time or aggregated
//! into a batch holding one message from every child.
//!
//! Per-host [`Service`]s answer client requests and may start protocol runs
//! of their own.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use arbor_overlay::protocols::CountProtocol;
//! use arbor_overlay::{LocalTest, Registry};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), arbor_overlay::OverlayError> {
//! let registry = Arc::new(Registry::with_builtin_protocols()?);
//! let mut local = LocalTest::new(registry);
//! let (hosts, tree) = local.gen_tree(3, true).await?;
//!
//! let mut count = hosts[0].create_protocol_typed::<CountProtocol>(CountProtocol::NAME, &tree)?;
//! let result = count.take_result().expect("fresh instance");
//! hosts[0].start_protocol(count).await?;
//! assert_eq!(result.await.ok(), Some(3));
//!
//! local.close_all().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod dispatch;
mod error;
mod host;
mod local;
mod messages;
mod node;
mod overlay;
mod protocol;
pub mod protocols;
mod registry;
mod roster;
mod service;
mod token;
mod tree;

pub use client::Client;
pub use config::HostConfig;
pub use dispatch::{run_handlers, Flag};
pub use error::OverlayError;
pub use host::{Host, HostStatus};
pub use local::LocalTest;
pub use messages::{ClientRequest, StatusRet};
pub use node::TreeNodeInstance;
pub use protocol::{downcast_protocol, AsAny, Handle, HandleAll, Incoming, Mailbox, ProtocolInstance};
pub use registry::{ProtocolConstructor, Registry, ServiceFactory};
pub use roster::{Roster, RosterId};
pub use service::{Context, Reply, Service, ServiceProcessor};
pub use token::{ProtocolId, RoundId, ServiceId, Token};
pub use tree::{NodeMarshal, Tree, TreeId, TreeMarshal, TreeNode, TreeNodeId};

pub use arbor_transport::{Keypair, Message, MessageTypeId, ServerId, ServerIdentity};
