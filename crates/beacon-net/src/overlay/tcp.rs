//! TCP overlay
//!
//! Each connection starts with a signed [`Hello`] in both directions, then
//! carries length-prefixed frames. Every node keeps a rendezvous registry
//! fed by its neighbours' advertisements and answers `FindPeers` from it,
//! so any connected node can act as a rendezvous point. Publishing sends to
//! every open link (full mesh, no re-forwarding); a link whose queue is full
//! misses the message. Idle links carry pings, and a link that stays silent
//! for [`IDLE_PINGS`] keepalive periods is dropped.

use super::{
    Overlay, OverlayError, OverlayMessage, Subscription, Topic, REQUEST_TIMEOUT,
    SUBSCRIPTION_BUFFER,
};
use crate::framing::{Frame, FrameCodec, FrameType};
use crate::identity::{Hello, Identity};
use crate::peer::{PeerId, PeerInfo};
use crate::session::Session;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Registrations not refreshed within this window are forgotten
const REGISTRATION_TTL: Duration = Duration::from_secs(15 * 60);

/// Idle time after which a link sends a ping
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Keepalive periods of silence before a link is dropped
pub const IDLE_PINGS: u32 = 3;

type FramedStream = Framed<TcpStream, FrameCodec>;

#[derive(Serialize, Deserialize)]
struct AdvertiseBody {
    rendezvous: String,
    peer: PeerInfo,
}

#[derive(Serialize, Deserialize)]
struct FindPeersBody {
    request_id: u64,
    rendezvous: String,
}

#[derive(Serialize, Deserialize)]
struct PeerListBody {
    request_id: u64,
    peers: Vec<PeerInfo>,
}

#[derive(Serialize, Deserialize)]
struct PublishBody {
    topic: String,
    data: Vec<u8>,
}

/// Open connection to a neighbour
struct Link {
    /// Dialable address of the neighbour's listener
    addr: SocketAddr,
    tx: mpsc::Sender<Frame>,
}

struct Inner {
    identity: Identity,
    local_id: PeerId,
    listen_addr: SocketAddr,
    links: RwLock<HashMap<PeerId, Link>>,
    registry: RwLock<HashMap<String, HashMap<PeerId, PeerInfo>>>,
    subscriptions: RwLock<HashMap<String, Vec<mpsc::Sender<OverlayMessage>>>>,
    /// Outstanding FindPeers queries
    pending: Mutex<HashMap<u64, mpsc::Sender<Vec<PeerInfo>>>>,
    next_request: AtomicU64,
    keepalive: Duration,
    shutdown: CancellationToken,
}

/// Overlay node speaking framed TCP
#[derive(Clone)]
pub struct TcpOverlay {
    inner: Arc<Inner>,
}

impl TcpOverlay {
    /// Listen on `listen` and start accepting neighbours
    pub async fn bind(identity: Identity, listen: SocketAddr) -> Result<Self, OverlayError> {
        Self::bind_with_keepalive(identity, listen, KEEPALIVE_INTERVAL).await
    }

    pub async fn bind_with_keepalive(
        identity: Identity,
        listen: SocketAddr,
        keepalive: Duration,
    ) -> Result<Self, OverlayError> {
        let listener = TcpListener::bind(listen).await?;
        let listen_addr = listener.local_addr()?;
        let local_id = identity.peer_id();

        let inner = Arc::new(Inner {
            identity,
            local_id,
            listen_addr,
            links: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            keepalive,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inner.clone().accept_loop(listener));
        info!(peer = %local_id, addr = %listen_addr, "Overlay listening");

        Ok(Self { inner })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Dial bootstrap addresses, returning how many answered
    pub async fn bootstrap(&self, addrs: &[SocketAddr]) -> usize {
        let mut connected = 0;
        for addr in addrs {
            match self.inner.connect(*addr, None).await {
                Ok(peer) => {
                    info!(peer = %peer, addr = %addr, "Connected to bootstrap peer");
                    connected += 1;
                }
                Err(e) => warn!(addr = %addr, "Bootstrap dial failed: {}", e),
            }
        }
        connected
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote)) => {
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.accept(stream, remote).await {
                                debug!(remote = %remote, "Inbound overlay connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Overlay accept error: {}", e),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<(), OverlayError> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let hello = self.handshake(&mut framed).await?;
        let addr = dialable(&hello, remote);
        if self.attach(hello.peer_id, addr, framed) {
            debug!(peer = %hello.peer_id, addr = %addr, "Accepted overlay peer");
        }
        Ok(())
    }

    /// Dial `addr`; with `expected` set the remote must prove that identity
    async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        expected: Option<PeerId>,
    ) -> Result<PeerId, OverlayError> {
        if self.is_closed() {
            return Err(OverlayError::Closed);
        }
        let stream = timeout(REQUEST_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| OverlayError::Timeout)??;
        let mut framed = Framed::new(stream, FrameCodec::new());
        let hello = self.handshake(&mut framed).await?;

        if let Some(expected) = expected {
            if hello.peer_id != expected {
                return Err(OverlayError::Protocol(format!(
                    "expected peer {} at {}, found {}",
                    expected, addr, hello.peer_id
                )));
            }
        }
        self.attach(hello.peer_id, dialable(&hello, addr), framed);
        Ok(hello.peer_id)
    }

    async fn handshake(&self, framed: &mut FramedStream) -> Result<Hello, OverlayError> {
        let ours = self.identity.hello(self.listen_addr);
        framed.send(Frame::encode(FrameType::Hello, &ours)?).await?;

        let frame = timeout(REQUEST_TIMEOUT, framed.next())
            .await
            .map_err(|_| OverlayError::Timeout)?
            .ok_or(OverlayError::Closed)??;
        if frame.frame_type != FrameType::Hello {
            return Err(OverlayError::Protocol(format!(
                "expected hello, got {:?}",
                frame.frame_type
            )));
        }

        let hello: Hello = frame.decode()?;
        hello.verify()?;
        if hello.peer_id == self.local_id {
            return Err(OverlayError::Protocol("connected to self".into()));
        }
        Ok(hello)
    }

    /// Start the link tasks; false when the peer already has a link
    fn attach(self: &Arc<Self>, peer: PeerId, addr: SocketAddr, framed: FramedStream) -> bool {
        let (tx, mut rx) = mpsc::channel::<Frame>(SUBSCRIPTION_BUFFER);
        {
            let mut links = self.links.write();
            if links.contains_key(&peer) {
                return false;
            }
            links.insert(peer, Link { addr, tx });
        }

        let inner = self.clone();
        let keepalive = self.keepalive;
        tokio::spawn(async move {
            let (mut sink, mut stream) = framed.split();
            let writer = async {
                loop {
                    let frame = match timeout(keepalive, rx.recv()).await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(_) => Frame::ping(),
                    };
                    if let Err(e) = sink.send(frame).await {
                        debug!(peer = %peer, "Overlay write failed: {}", e);
                        break;
                    }
                }
            };
            let reader = async {
                loop {
                    match timeout(keepalive * IDLE_PINGS, stream.next()).await {
                        Ok(Some(Ok(frame))) => inner.handle_frame(peer, frame).await,
                        Ok(Some(Err(e))) => {
                            debug!(peer = %peer, "Overlay read failed: {}", e);
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            info!(peer = %peer, "Overlay link silent, dropping");
                            break;
                        }
                    }
                }
            };

            tokio::select! {
                _ = writer => {}
                _ = reader => {}
                _ = inner.shutdown.cancelled() => {}
            }
            inner.links.write().remove(&peer);
            debug!(peer = %peer, "Overlay link closed");
        });
        true
    }

    async fn handle_frame(&self, from: PeerId, frame: Frame) {
        match frame.frame_type {
            FrameType::Ping => self.send_to(&from, Frame::pong()).await,
            FrameType::Pong => {}
            FrameType::Publish => match frame.decode::<PublishBody>() {
                Ok(body) => self.deliver(from, &body.topic, body.data),
                Err(e) => debug!(peer = %from, "Bad publish frame: {}", e),
            },
            FrameType::Advertise => match frame.decode::<AdvertiseBody>() {
                Ok(body) => self.register(from, body),
                Err(e) => debug!(peer = %from, "Bad advertise frame: {}", e),
            },
            FrameType::FindPeers => match frame.decode::<FindPeersBody>() {
                Ok(body) => {
                    let reply = PeerListBody {
                        request_id: body.request_id,
                        peers: self.registered(&body.rendezvous),
                    };
                    match Frame::encode(FrameType::PeerList, &reply) {
                        Ok(frame) => self.send_to(&from, frame).await,
                        Err(e) => warn!("Failed to encode peer list: {}", e),
                    }
                }
                Err(e) => debug!(peer = %from, "Bad find-peers frame: {}", e),
            },
            FrameType::PeerList => match frame.decode::<PeerListBody>() {
                Ok(body) => {
                    if let Some(tx) = self.pending.lock().get(&body.request_id) {
                        let _ = tx.try_send(body.peers);
                    }
                }
                Err(e) => debug!(peer = %from, "Bad peer list frame: {}", e),
            },
            other => trace!(peer = %from, "Ignoring {:?} frame", other),
        }
    }

    async fn send_to(&self, peer: &PeerId, frame: Frame) {
        let tx = self.links.read().get(peer).map(|link| link.tx.clone());
        if let Some(tx) = tx {
            if tx.send(frame).await.is_err() {
                debug!(peer = %peer, "Link closed before send");
            }
        }
    }

    fn link_senders(&self) -> Vec<(PeerId, mpsc::Sender<Frame>)> {
        self.links
            .read()
            .iter()
            .map(|(id, link)| (*id, link.tx.clone()))
            .collect()
    }

    fn deliver(&self, from: PeerId, topic: &str, data: Vec<u8>) {
        let mut subscriptions = self.subscriptions.write();
        let Some(subscribers) = subscriptions.get_mut(topic) else {
            return;
        };
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            let message = OverlayMessage {
                from,
                topic: topic.to_string(),
                data: data.clone(),
            };
            if tx.try_send(message).is_err() {
                trace!(topic = %topic, "Subscriber full, dropping message");
            }
        }
    }

    fn register(&self, from: PeerId, body: AdvertiseBody) {
        let mut peer = body.peer;
        if peer.id == self.local_id {
            return;
        }
        // The advertiser's own view of its address may be a wildcard bind
        if peer.id == from {
            if let Some(link) = self.links.read().get(&from) {
                peer.addrs = vec![link.addr];
            }
        }
        peer.touch();
        trace!(peer = %peer.id, rendezvous = %body.rendezvous, "Registered peer");
        self.registry
            .write()
            .entry(body.rendezvous)
            .or_default()
            .insert(peer.id, peer);
    }

    /// Unexpired registrations under a rendezvous
    fn registered(&self, rendezvous: &str) -> Vec<PeerInfo> {
        let cutoff = now_millis().saturating_sub(REGISTRATION_TTL.as_millis() as u64);
        let mut registry = self.registry.write();
        let Some(peers) = registry.get_mut(rendezvous) else {
            return Vec::new();
        };
        peers.retain(|_, info| info.last_seen >= cutoff);
        peers.values().cloned().collect()
    }
}

/// Listener address as seen from the remote side of a connection
fn dialable(hello: &Hello, remote: SocketAddr) -> SocketAddr {
    if hello.listen_addr.ip().is_unspecified() {
        SocketAddr::new(remote.ip(), hello.listen_addr.port())
    } else {
        hello.listen_addr
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[async_trait]
impl Overlay for TcpOverlay {
    fn local_peer(&self) -> PeerId {
        self.inner.local_id
    }

    async fn join(&self, name: &str) -> Result<Topic, OverlayError> {
        if self.inner.is_closed() {
            return Err(OverlayError::Closed);
        }
        Ok(Topic {
            name: name.to_string(),
        })
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, OverlayError> {
        if self.inner.is_closed() {
            return Err(OverlayError::Closed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner
            .subscriptions
            .write()
            .entry(topic.name.clone())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic.name.clone(), rx))
    }

    async fn publish(&self, topic: &Topic, data: Vec<u8>) -> Result<(), OverlayError> {
        if self.inner.is_closed() {
            return Err(OverlayError::Closed);
        }
        let frame = Frame::encode(
            FrameType::Publish,
            &PublishBody {
                topic: topic.name.clone(),
                data: data.clone(),
            },
        )?;

        self.inner.deliver(self.inner.local_id, &topic.name, data);
        for (peer, tx) in self.inner.link_senders() {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %peer, topic = %topic.name, "Link queue full, dropping message")
                }
                Err(TrySendError::Closed(_)) => debug!(peer = %peer, "Link closed during publish"),
            }
        }
        Ok(())
    }

    async fn advertise(&self, rendezvous: &str) -> Result<(), OverlayError> {
        if self.inner.is_closed() {
            return Err(OverlayError::Closed);
        }
        let me = PeerInfo::new(self.inner.local_id, vec![self.inner.listen_addr]);
        self.inner
            .registry
            .write()
            .entry(rendezvous.to_string())
            .or_default()
            .insert(me.id, me.clone());

        let links = self.inner.link_senders();
        if links.is_empty() {
            return Err(OverlayError::NoPeers);
        }
        let frame = Frame::encode(
            FrameType::Advertise,
            &AdvertiseBody {
                rendezvous: rendezvous.to_string(),
                peer: me,
            },
        )?;
        for (peer, tx) in links {
            if tx.try_send(frame.clone()).is_err() {
                debug!(peer = %peer, "Advertise not queued");
            }
        }
        Ok(())
    }

    async fn find_peers(&self, rendezvous: &str) -> Result<Vec<PeerInfo>, OverlayError> {
        if self.inner.is_closed() {
            return Err(OverlayError::Closed);
        }
        let mut found: HashMap<PeerId, PeerInfo> = self
            .inner
            .registered(rendezvous)
            .into_iter()
            .map(|info| (info.id, info))
            .collect();

        let links = self.inner.link_senders();
        if !links.is_empty() {
            let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
            let (tx, mut rx) = mpsc::channel(links.len());
            self.inner.pending.lock().insert(request_id, tx);

            let frame = Frame::encode(
                FrameType::FindPeers,
                &FindPeersBody {
                    request_id,
                    rendezvous: rendezvous.to_string(),
                },
            )?;
            let mut asked = 0;
            for (_, link) in &links {
                if link.send(frame.clone()).await.is_ok() {
                    asked += 1;
                }
            }

            let collect = async {
                for _ in 0..asked {
                    match rx.recv().await {
                        Some(peers) => {
                            for info in peers {
                                found.entry(info.id).or_insert(info);
                            }
                        }
                        None => break,
                    }
                }
            };
            if timeout(REQUEST_TIMEOUT, collect).await.is_err() {
                debug!(rendezvous = %rendezvous, "Some rendezvous queries timed out");
            }
            self.inner.pending.lock().remove(&request_id);
        }

        found.remove(&self.inner.local_id);
        Ok(found.into_values().collect())
    }

    async fn dial(&self, peer: &PeerInfo) -> Result<(), OverlayError> {
        if peer.id == self.inner.local_id {
            return Err(OverlayError::Unreachable(peer.id));
        }
        if self.is_connected(&peer.id) {
            return Ok(());
        }
        for addr in &peer.addrs {
            match self.inner.connect(*addr, Some(peer.id)).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!(peer = %peer.id, addr = %addr, "Dial failed: {}", e),
            }
        }
        Err(OverlayError::Unreachable(peer.id))
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.links.read().contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.links.read().keys().copied().collect()
    }
}

#[async_trait]
impl Session for TcpOverlay {
    fn name(&self) -> String {
        format!("tcp-overlay/{}", self.inner.local_id)
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.links.write().clear();
        self.inner.subscriptions.write().clear();
        self.inner.pending.lock().clear();
    }
}
