//! Replicated session attribute cache.
//!
//! Every node keeps in-process replicas of the sessions it serves. Writes go
//! to a shared key/value store, then a change message goes out on a
//! publish/subscribe bus so the other nodes update their replicas without
//! re-reading the store.
//!
//! ```no_run
//! # async fn demo() -> sessmesh_core::Result<()> {
//! use std::sync::Arc;
//! use sessmesh_core::{LocalBus, ManagerConfig, MemoryBackend, SessionNode};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let bus = Arc::new(LocalBus::default());
//! let node = SessionNode::start(ManagerConfig::default(), backend, bus).await?;
//!
//! let session = node.manager().create_new(None);
//! session.set_attribute("user", serde_json::json!("alice")).await?;
//! node.manager().complete_request(&session).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod manager;
pub mod message;
pub mod node;
pub mod replica;
pub mod store;

pub use bus::{ChangeBus, LocalBus, MessageHandler, Subscription};
pub use config::{EncodingFormat, ManagerConfig, ReadMode, UpdateMode};
pub use dispatcher::UpdateDispatcher;
pub use error::{Error, Result};
pub use ids::{NodeId, SessionIdGenerator, UlidGenerator};
pub use manager::{ListenerMetrics, RemoteOutcome, ReplicaManager};
pub use message::{AttrValue, Change, ChangeMessage, Codec};
pub use node::SessionNode;
pub use replica::{Lifecycle, SessionReplica};
pub use store::{KeyValueBackend, MemoryBackend, RemoteAttributeStore, SqliteBackend};
