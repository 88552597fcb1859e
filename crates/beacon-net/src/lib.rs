//! Networking primitives for beacon
//!
//! This crate provides:
//! - Overlay identities derived from operator seeds
//! - Length-prefixed message framing
//! - Pub/sub overlay with rendezvous discovery (TCP and in-memory)
//! - Request/reply message bus with queue groups (TCP and in-memory)
//! - A registry closing every transport session on shutdown

pub mod bus;
pub mod framing;
pub mod identity;
pub mod overlay;
pub mod peer;
pub mod session;

pub use bus::{BusError, BusRequest, BusServer, MemoryBus, MessageBus, QueueSubscription, TcpBus};
pub use framing::{Frame, FrameCodec, FrameType};
pub use identity::{Identity, AUTO_SEED};
pub use overlay::{
    MemoryNetwork, MemoryOverlay, Overlay, OverlayError, OverlayMessage, Subscription, TcpOverlay,
    Topic,
};
pub use peer::{PeerId, PeerInfo};
pub use session::{Session, SessionRegistry};
