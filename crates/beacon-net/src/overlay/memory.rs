//! In-process overlay network
//!
//! Every [`MemoryOverlay`] created from one [`MemoryNetwork`] shares a
//! single routing table. Messages reach the publisher itself and the peers
//! it has a link to; links form by dialing, like the TCP overlay.

use super::{Overlay, OverlayError, OverlayMessage, Subscription, Topic, SUBSCRIPTION_BUFFER};
use crate::identity::Identity;
use crate::peer::{PeerId, PeerInfo};
use crate::session::Session;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Default)]
struct NetworkState {
    /// Open nodes and their topic subscribers
    nodes: HashMap<PeerId, HashMap<String, Vec<mpsc::Sender<OverlayMessage>>>>,
    /// Undirected links, stored with the lower id first
    links: HashSet<(PeerId, PeerId)>,
    rendezvous: HashMap<String, BTreeSet<PeerId>>,
    /// Nodes that refuse every link
    isolated: HashSet<PeerId>,
}

impl NetworkState {
    fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.contains(&Self::link_key(a, b))
    }

    fn drop_links(&mut self, peer: PeerId) {
        self.links.retain(|(a, b)| *a != peer && *b != peer);
    }
}

/// Shared routing table for in-memory overlays
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node with the given identity
    pub fn node(&self, identity: &Identity) -> MemoryOverlay {
        let id = identity.peer_id();
        self.state.lock().nodes.entry(id).or_default();
        MemoryOverlay {
            id,
            network: self.clone(),
        }
    }

    /// Cut every link of `peer` and refuse new ones
    pub fn isolate(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.drop_links(*peer);
        state.isolated.insert(*peer);
    }

    /// Allow `peer` to form links again
    pub fn heal(&self, peer: &PeerId) {
        self.state.lock().isolated.remove(peer);
    }

    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().links.remove(&NetworkState::link_key(*a, *b));
    }
}

/// One node on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryOverlay {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryOverlay {
    fn ensure_open(&self, state: &NetworkState) -> Result<(), OverlayError> {
        if state.nodes.contains_key(&self.id) {
            Ok(())
        } else {
            Err(OverlayError::Closed)
        }
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    async fn join(&self, name: &str) -> Result<Topic, OverlayError> {
        let state = self.network.state.lock();
        self.ensure_open(&state)?;
        Ok(Topic {
            name: name.to_string(),
        })
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, OverlayError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut state = self.network.state.lock();
        let node = state.nodes.get_mut(&self.id).ok_or(OverlayError::Closed)?;
        node.entry(topic.name.clone()).or_default().push(tx);
        Ok(Subscription::new(topic.name.clone(), rx))
    }

    async fn publish(&self, topic: &Topic, data: Vec<u8>) -> Result<(), OverlayError> {
        let mut state = self.network.state.lock();
        self.ensure_open(&state)?;

        let targets: Vec<PeerId> = state
            .nodes
            .keys()
            .copied()
            .filter(|peer| *peer == self.id || state.linked(self.id, *peer))
            .collect();

        for peer in targets {
            let Some(subscribers) = state
                .nodes
                .get_mut(&peer)
                .and_then(|topics| topics.get_mut(&topic.name))
            else {
                continue;
            };
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                let message = OverlayMessage {
                    from: self.id,
                    topic: topic.name.clone(),
                    data: data.clone(),
                };
                if tx.try_send(message).is_err() {
                    trace!(peer = %peer, topic = %topic.name, "Subscriber full, dropping message");
                }
            }
        }
        Ok(())
    }

    async fn advertise(&self, rendezvous: &str) -> Result<(), OverlayError> {
        let mut state = self.network.state.lock();
        self.ensure_open(&state)?;
        state
            .rendezvous
            .entry(rendezvous.to_string())
            .or_default()
            .insert(self.id);
        Ok(())
    }

    async fn find_peers(&self, rendezvous: &str) -> Result<Vec<PeerInfo>, OverlayError> {
        let state = self.network.state.lock();
        self.ensure_open(&state)?;
        Ok(state
            .rendezvous
            .get(rendezvous)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|peer| **peer != self.id && state.nodes.contains_key(peer))
                    .map(|peer| PeerInfo::new(*peer, Vec::new()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn dial(&self, peer: &PeerInfo) -> Result<(), OverlayError> {
        let mut state = self.network.state.lock();
        self.ensure_open(&state)?;
        if peer.id == self.id
            || !state.nodes.contains_key(&peer.id)
            || state.isolated.contains(&self.id)
            || state.isolated.contains(&peer.id)
        {
            return Err(OverlayError::Unreachable(peer.id));
        }
        state.links.insert(NetworkState::link_key(self.id, peer.id));
        debug!(peer = %peer.id, "Linked in-memory peer");
        Ok(())
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network.state.lock().linked(self.id, *peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.network.state.lock();
        state
            .links
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.id {
                    Some(*b)
                } else if *b == self.id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Session for MemoryOverlay {
    fn name(&self) -> String {
        format!("memory-overlay/{}", self.id)
    }

    async fn close(&self) {
        let mut state = self.network.state.lock();
        // Dropping the senders ends every subscription of this node
        state.nodes.remove(&self.id);
        state.drop_links(self.id);
        for peers in state.rendezvous.values_mut() {
            peers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (MemoryNetwork, MemoryOverlay, MemoryOverlay) {
        let network = MemoryNetwork::new();
        let a = network.node(&Identity::generate());
        let b = network.node(&Identity::generate());
        (network, a, b)
    }

    #[tokio::test]
    async fn test_publish_reaches_self_and_linked_peers() {
        let (network, a, b) = pair();
        let c = network.node(&Identity::generate());

        let topic = a.join("room").await.unwrap();
        let mut sub_a = a.subscribe(&topic).await.unwrap();
        let mut sub_b = b.subscribe(&topic).await.unwrap();
        let mut sub_c = c.subscribe(&topic).await.unwrap();

        a.dial(&PeerInfo::new(b.local_peer(), vec![])).await.unwrap();
        a.publish(&topic, b"hello".to_vec()).await.unwrap();

        let own = sub_a.next().await.unwrap();
        assert_eq!(own.from, a.local_peer());
        let got = sub_b.next().await.unwrap();
        assert_eq!(got.from, a.local_peer());
        assert_eq!(got.data, b"hello");
        assert!(sub_c.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rendezvous_discovery() {
        let (_network, a, b) = pair();
        a.advertise("room").await.unwrap();
        b.advertise("room").await.unwrap();

        let found = a.find_peers("room").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.local_peer());
        assert!(a.find_peers("elsewhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_isolation_refuses_links() {
        let (network, a, b) = pair();
        a.dial(&PeerInfo::new(b.local_peer(), vec![])).await.unwrap();
        assert!(a.is_connected(&b.local_peer()));
        assert_eq!(b.connected_peers(), vec![a.local_peer()]);

        network.isolate(&b.local_peer());
        assert!(!a.is_connected(&b.local_peer()));
        assert!(a.dial(&PeerInfo::new(b.local_peer(), vec![])).await.is_err());

        network.heal(&b.local_peer());
        a.dial(&PeerInfo::new(b.local_peer(), vec![])).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let (_network, a, b) = pair();
        let topic = a.join("room").await.unwrap();
        let mut sub = a.subscribe(&topic).await.unwrap();
        b.advertise("room").await.unwrap();

        b.close().await;
        assert!(a.find_peers("room").await.unwrap().is_empty());

        a.close().await;
        assert!(sub.next().await.is_none());
        assert!(matches!(a.publish(&topic, vec![]).await, Err(OverlayError::Closed)));
    }
}
