//! Gossip replication over the overlay
//!
//! One [`Replication`] owns an overlay identity: it joins the room topic,
//! keeps itself advertised and connected, applies what peers publish and
//! watches for isolation. Writes leave through a [`GossipPublisher`].

use crate::directory::{DirectoryHandler, FacadeError};
use crate::ipc::{IpcClient, IpcError};
use beacon_core::{DirectoryEntry, GossipMessage, Operation};
use beacon_net::{Overlay, OverlayError, OverlayMessage, Subscription, Topic};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("Codec error: {0}")]
    Codec(#[from] beacon_core::Error),
    #[error("Advertise failed after {attempts} attempts: {source}")]
    Advertise {
        attempts: u32,
        source: OverlayError,
    },
    #[error("Relay failed: {0}")]
    Relay(#[from] IpcError),
    #[error("Apply failed: {0}")]
    Apply(#[from] FacadeError),
    #[error("Discovery task failed: {0}")]
    Task(String),
}

/// How a replication loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Shutdown was requested
    Shutdown,
    /// Nothing arrived within the liveness window
    Isolated,
}

/// Timing of the replication background work
#[derive(Clone, Debug)]
pub struct GossipSettings {
    /// Topic and rendezvous string
    pub room: String,
    pub advertise_attempts: u32,
    pub readvertise_attempts: u32,
    pub advertise_retry: Duration,
    pub readvertise_every: Duration,
    pub discovery_every: Duration,
    pub heartbeat_every: Duration,
    /// Liveness window until the first heartbeat arrives
    pub initial_window: Duration,
    /// Liveness window once heartbeats are flowing
    pub heartbeat_window: Duration,
}

impl GossipSettings {
    pub fn new(room: &str) -> Self {
        Self {
            room: room.to_string(),
            advertise_attempts: 10,
            readvertise_attempts: 100,
            advertise_retry: Duration::from_secs(60),
            readvertise_every: Duration::from_secs(5 * 60),
            discovery_every: Duration::from_secs(15),
            heartbeat_every: Duration::from_secs(30),
            initial_window: Duration::from_secs(15 * 60),
            heartbeat_window: Duration::from_secs(3 * 60),
        }
    }
}

/// Tracks the last inbound message against a shrinking window
#[derive(Clone, Debug)]
pub struct LivenessWindow {
    last_seen: Instant,
    window: Duration,
    heartbeat_window: Duration,
}

impl LivenessWindow {
    pub fn new(initial: Duration, heartbeat_window: Duration, now: Instant) -> Self {
        Self {
            last_seen: now,
            window: initial,
            heartbeat_window,
        }
    }

    /// Any inbound message counts; a heartbeat also shortens the window
    pub fn observe(&mut self, heartbeat: bool, now: Instant) {
        self.last_seen = now;
        if heartbeat {
            self.window = self.heartbeat_window;
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.window
    }
}

/// Publishing handle on a joined topic
#[derive(Clone)]
pub struct GossipPublisher {
    overlay: Arc<dyn Overlay>,
    topic: Topic,
}

impl GossipPublisher {
    pub fn new(overlay: Arc<dyn Overlay>, topic: Topic) -> Self {
        Self { overlay, topic }
    }

    pub async fn publish(&self, message: &GossipMessage) -> Result<(), GossipError> {
        self.overlay
            .publish(&self.topic, message.to_bytes()?)
            .await?;
        Ok(())
    }

    pub async fn publish_op(&self, op: Operation, entry: &DirectoryEntry) -> Result<(), GossipError> {
        self.publish(&GossipMessage::operation(op, entry)?).await
    }

    pub async fn heartbeat(&self) -> Result<(), GossipError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.publish_op(Operation::Add, &DirectoryEntry::heartbeat(now))
            .await
    }
}

/// Where received writes end up
#[derive(Clone)]
pub enum InboundSink {
    /// This process owns the store
    Local(DirectoryHandler),
    /// The store lives in the parent process
    Parent(IpcClient),
}

impl InboundSink {
    async fn deliver(&self, message: &GossipMessage) -> Result<(), GossipError> {
        match self {
            Self::Local(directory) => directory.apply_gossip(message).await?,
            Self::Parent(client) => client.relay_up(message).await?,
        }
        Ok(())
    }
}

/// Replication instance bound to one overlay identity
pub struct Replication {
    overlay: Arc<dyn Overlay>,
    topic: Topic,
    subscription: Subscription,
    settings: GossipSettings,
}

impl Replication {
    /// Join and subscribe to the room topic
    pub async fn join(overlay: Arc<dyn Overlay>, settings: GossipSettings) -> Result<Self, GossipError> {
        let topic = overlay.join(&settings.room).await?;
        let subscription = overlay.subscribe(&topic).await?;
        info!(peer = %overlay.local_peer(), room = %settings.room, "Joined gossip room");
        Ok(Self {
            overlay,
            topic,
            subscription,
            settings,
        })
    }

    pub fn publisher(&self) -> GossipPublisher {
        GossipPublisher::new(self.overlay.clone(), self.topic.clone())
    }

    /// Consume the room until shutdown, isolation or a fatal advertise failure
    pub async fn run(
        mut self,
        sink: InboundSink,
        shutdown: CancellationToken,
    ) -> Result<ReplicationOutcome, GossipError> {
        let local = self.overlay.local_peer();
        let publisher = self.publisher();

        let maintenance_token = shutdown.child_token();
        let mut maintenance = tokio::spawn(maintain(
            self.overlay.clone(),
            self.settings.clone(),
            maintenance_token.clone(),
        ));

        let every = self.settings.heartbeat_every;
        let mut heartbeat = interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = LivenessWindow::new(
            self.settings.initial_window,
            self.settings.heartbeat_window,
            Instant::now(),
        );

        let outcome = loop {
            tokio::select! {
                message = self.subscription.next() => {
                    let Some(message) = message else {
                        break Err(GossipError::Overlay(OverlayError::Closed));
                    };
                    if message.from == local {
                        continue;
                    }
                    receive(&message, &sink, &mut liveness).await;
                }
                _ = heartbeat.tick() => {
                    if liveness.is_expired(Instant::now()) {
                        warn!(
                            peer = %local,
                            window = ?liveness.window(),
                            "No gossip received within the liveness window"
                        );
                        break Ok(ReplicationOutcome::Isolated);
                    }
                    match publisher.heartbeat().await {
                        Ok(()) => trace!("Heartbeat sent"),
                        Err(e) => warn!("Failed to publish heartbeat: {}", e),
                    }
                }
                result = &mut maintenance => {
                    break match result {
                        Ok(Ok(())) => Ok(ReplicationOutcome::Shutdown),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(GossipError::Task(e.to_string())),
                    };
                }
                _ = shutdown.cancelled() => break Ok(ReplicationOutcome::Shutdown),
            }
        };

        maintenance_token.cancel();
        outcome
    }
}

async fn receive(message: &OverlayMessage, sink: &InboundSink, liveness: &mut LivenessWindow) {
    let gossip = match GossipMessage::from_bytes(&message.data) {
        Ok(gossip) => gossip,
        Err(e) => {
            debug!(from = %message.from, "Dropping undecodable gossip: {}", e);
            return;
        }
    };
    let (op, entry) = match gossip.directory_op() {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(from = %message.from, context = %gossip.context, "Dropping gossip: {}", e);
            return;
        }
    };

    liveness.observe(entry.is_heartbeat(), Instant::now());
    if entry.is_heartbeat() {
        trace!(from = %message.from, "Heartbeat received");
        return;
    }

    debug!(from = %message.from, op = ?op, name = %entry.name, "Gossip received");
    if let Err(e) = sink.deliver(&gossip).await {
        warn!(from = %message.from, "Failed to handle gossip: {}", e);
    }
}

/// Advertise, re-advertise and dial discovered peers until cancelled
async fn maintain(
    overlay: Arc<dyn Overlay>,
    settings: GossipSettings,
    shutdown: CancellationToken,
) -> Result<(), GossipError> {
    advertise(
        overlay.as_ref(),
        &settings,
        settings.advertise_attempts,
        &shutdown,
    )
    .await?;

    let every = settings.readvertise_every;
    let mut readvertise = interval_at(Instant::now() + every, every);
    let mut discovery = interval(settings.discovery_every);
    discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = readvertise.tick() => {
                advertise(overlay.as_ref(), &settings, settings.readvertise_attempts, &shutdown).await?;
            }
            _ = discovery.tick() => discover(overlay.as_ref(), &settings.room).await,
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn advertise(
    overlay: &dyn Overlay,
    settings: &GossipSettings,
    attempts: u32,
    shutdown: &CancellationToken,
) -> Result<(), GossipError> {
    let mut attempt = 1;
    loop {
        match overlay.advertise(&settings.room).await {
            Ok(()) => {
                debug!(room = %settings.room, attempt, "Advertise complete");
                return Ok(());
            }
            Err(source) if attempt >= attempts => {
                return Err(GossipError::Advertise {
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => warn!(room = %settings.room, attempt, "Advertise failed: {}", e),
        }

        attempt += 1;
        tokio::select! {
            _ = sleep(settings.advertise_retry) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn discover(overlay: &dyn Overlay, room: &str) {
    let peers = match overlay.find_peers(room).await {
        Ok(peers) => peers,
        Err(e) => {
            debug!(room = %room, "Peer discovery failed: {}", e);
            return;
        }
    };

    for peer in peers {
        if overlay.is_connected(&peer.id) {
            continue;
        }
        match overlay.dial(&peer).await {
            Ok(()) => info!(peer = %peer.id, "Connected to discovered peer"),
            Err(e) => debug!(peer = %peer.id, "Dial failed: {}", e),
        }
    }
}
