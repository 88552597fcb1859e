//! beacon core library
//!
//! This crate provides the data model, key hashing, message codecs and
//! access-control primitives shared by every beacon process.
//!
//! # Modules
//!
//! - [`types`]: Directory entries, list requests, responses and TTL modes
//! - [`message`]: Gossip and IPC message envelopes
//! - [`crypto`]: Key hashing, identity seed derivation and signature checks
//! - [`confidential`]: Prefix policy for signed directory access
//! - [`error`]: Error types

pub mod confidential;
pub mod crypto;
pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{GossipMessage, IpcMessage, IpcMessageType, Operation};
pub use types::*;
