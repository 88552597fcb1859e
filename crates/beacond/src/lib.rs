//! beacond - replicated rendezvous directory daemon
//!
//! This crate provides:
//! - TTL-bounded directory storage (in-memory LRU or redis)
//! - The request handler with confidential prefix checks
//! - Gossip replication with isolation detection
//! - Parent/child fan-out over a message bus
//! - Child process supervision and node announcements

pub mod announce;
pub mod config;
pub mod directory;
pub mod gossip;
pub mod ipc;
pub mod policy;
pub mod server;
pub mod storage;
pub mod supervisor;

pub use config::Config;
pub use directory::{Capabilities, DirectoryHandler};
pub use gossip::{GossipPublisher, Replication, ReplicationOutcome};
pub use server::Server;
pub use storage::Directory;
