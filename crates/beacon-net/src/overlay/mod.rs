//! Pub/sub overlay with rendezvous discovery
//!
//! Peers join named topics, publish opaque payloads to every connected
//! member, and find each other by advertising under a rendezvous string.
//! A publisher's own subscriptions receive its messages too; consumers
//! filter on [`OverlayMessage::from`].

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryOverlay};
pub use tcp::TcpOverlay;

use crate::framing::FrameError;
use crate::identity::IdentityError;
use crate::peer::{PeerId, PeerInfo};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffered messages per subscription before new ones are dropped
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Deadline for rendezvous queries and handshakes
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Overlay errors
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] IdentityError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("Not connected to any peer")]
    NoPeers,
    #[error("Timed out")]
    Timeout,
    #[error("Overlay closed")]
    Closed,
}

/// A joined topic
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A message received on a topic
#[derive(Clone, Debug)]
pub struct OverlayMessage {
    /// Identity that published the message
    pub from: PeerId,
    pub topic: String,
    pub data: Vec<u8>,
}

/// Stream of messages for one topic
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<OverlayMessage>,
}

impl Subscription {
    fn new(topic: String, rx: mpsc::Receiver<OverlayMessage>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message; `None` once the overlay is closed
    pub async fn next(&mut self) -> Option<OverlayMessage> {
        self.rx.recv().await
    }
}

/// Peer-to-peer overlay transport
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Identity of this overlay node
    fn local_peer(&self) -> PeerId;

    /// Join a topic
    async fn join(&self, name: &str) -> Result<Topic, OverlayError>;

    /// Receive messages published on a joined topic
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, OverlayError>;

    /// Send a payload to every subscriber of the topic
    async fn publish(&self, topic: &Topic, data: Vec<u8>) -> Result<(), OverlayError>;

    /// Register this node under a rendezvous string
    async fn advertise(&self, rendezvous: &str) -> Result<(), OverlayError>;

    /// Peers registered under a rendezvous string, excluding this node
    async fn find_peers(&self, rendezvous: &str) -> Result<Vec<PeerInfo>, OverlayError>;

    /// Open a connection to a peer
    async fn dial(&self, peer: &PeerInfo) -> Result<(), OverlayError>;

    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Identities with an open connection
    fn connected_peers(&self) -> Vec<PeerId>;
}
