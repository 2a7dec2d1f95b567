//! Dynamic cluster membership on top of a hierarchical coordination service.
//!
//! This crate provides:
//! - Presence advertisement via ephemeral sequential nodes (one per process)
//! - A cached, atomically swapped list of every live member's address
//! - One-shot children watches that are re-armed on every refresh
//! - Leader/worker role transitions driving the registry
//!
//! Two coordination backends are included: [`RedisStore`] for real
//! deployments and [`MemoryStore`] for single-process use and tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use service_registry::{RedisStore, Role, RoleTransitionHandler, ServiceRegistry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let redis_url = std::env::var("REDIS_URL")?;
//!     let (session, events) = RedisStore::connect(&redis_url).await?;
//!
//!     let registry = Arc::new(ServiceRegistry::new(session.clone()));
//!     registry.ensure_registry_exists().await?;
//!     let cancel = CancellationToken::new();
//!     ServiceRegistry::spawn_watch_task(registry.clone(), events, cancel.clone());
//!
//!     // Role decided by an external election
//!     let handler = RoleTransitionHandler::new(registry.clone(), 8080);
//!     handler.apply(Role::Leader).await;
//!
//!     println!("workers: {:?}", registry.addresses().await?);
//!
//!     cancel.cancel();
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Failure Detection
//!
//! - **Graceful shutdown**: `close()` deletes the member node; watchers refresh instantly
//! - **Crash/kill -9**: the node's TTL lapses and a watcher's heartbeat prunes it
//!   within one TTL (default 30s)

mod config;
mod error;
mod memory;
mod redis_store;
mod registry;
mod role;
mod store;

pub use config::{Backend, NodeConfig};
pub use error::Error;
pub use memory::{MemorySession, MemoryStore};
pub use redis_store::RedisStore;
pub use registry::{
    MembershipEvent, Registration, RegistryRoot, ServiceRegistry, Unregistration,
    DEFAULT_REGISTRY_ROOT, MEMBER_PREFIX,
};
pub use role::{
    format_address, resolve_local_address, ElectionCallback, Role, RoleTransitionHandler,
    UNREGISTER_ATTEMPTS,
};
pub use store::{join_path, CoordinationStore, CreateMode, NodeStat, WatchEvent};
