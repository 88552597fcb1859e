//! Parent/child message exchange
//!
//! A parent serves `<subject>.up`: children relay gossip they received so the
//! parent's store applies it. Children serve `<subject>.down`: the parent
//! forwards local writes for one child to publish. Each side runs
//! [`QUEUE_SUBSCRIBERS`] members of one queue group per subject.

use crate::directory::DirectoryHandler;
use crate::gossip::GossipPublisher;
use async_trait::async_trait;
use beacon_core::message::{IPC_ERROR, IPC_SUCCESS, IPC_UNKNOWN};
use beacon_core::{DirectoryEntry, GossipMessage, IpcMessage, IpcMessageType, Operation};
use beacon_net::{BusError, MessageBus};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Queue subscribers per subject
pub const QUEUE_SUBSCRIBERS: usize = 16;

/// Deadline of every IPC request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Codec error: {0}")]
    Codec(#[from] beacon_core::Error),
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Which way a request travels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Child to parent
    Up,
    /// Parent to child
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    pub fn subject(self, base: &str) -> String {
        format!("{}.{}", base, self.as_str())
    }

    pub fn queue_group(self, base: &str) -> String {
        format!("queue.{}", self.subject(base))
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request side of the bus
#[derive(Clone)]
pub struct IpcClient {
    bus: Arc<dyn MessageBus>,
    subject: String,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(bus: Arc<dyn MessageBus>, subject: &str) -> Self {
        Self {
            bus,
            subject: subject.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one message and decode the reply
    pub async fn request(
        &self,
        direction: Direction,
        message: &IpcMessage,
    ) -> Result<IpcMessage, IpcError> {
        let subject = direction.subject(&self.subject);
        trace!(subject = %subject, kind = ?message.kind, "IPC request");
        let reply = self
            .bus
            .request(&subject, message.to_bytes()?, self.timeout)
            .await?;
        Ok(IpcMessage::from_bytes(&reply)?)
    }

    /// Check that a parent answers on `.up`
    pub async fn probe(&self) -> Result<(), IpcError> {
        self.request(Direction::Up, &IpcMessage::debug("Client Init"))
            .await?;
        debug!(subject = %self.subject, "IPC parent reachable");
        Ok(())
    }

    /// Hand a local write to one child for publishing
    pub async fn forward_down(&self, op: Operation, entry: &DirectoryEntry) -> Result<(), IpcError> {
        let gossip = GossipMessage::operation(op, entry)?;
        let message = IpcMessage::wrap(IpcMessageType::Ipc, &gossip)?;
        self.expect_success(Direction::Down, &message).await
    }

    /// Hand received gossip to the parent's store
    pub async fn relay_up(&self, gossip: &GossipMessage) -> Result<(), IpcError> {
        let message = IpcMessage::wrap(IpcMessageType::Soroban, gossip)?;
        self.expect_success(Direction::Up, &message).await
    }

    async fn expect_success(&self, direction: Direction, message: &IpcMessage) -> Result<(), IpcError> {
        let reply = self.request(direction, message).await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(IpcError::Rejected(reply.message))
        }
    }
}

/// Answers requests delivered to a queue subscriber
#[async_trait]
pub trait IpcHandler: Send + Sync + 'static {
    async fn handle(&self, message: IpcMessage) -> IpcMessage;
}

/// Parent side of `.up`: applies relayed gossip to the local store
pub struct ParentHandler {
    directory: DirectoryHandler,
}

impl ParentHandler {
    pub fn new(directory: DirectoryHandler) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl IpcHandler for ParentHandler {
    async fn handle(&self, message: IpcMessage) -> IpcMessage {
        match message.kind {
            IpcMessageType::Soroban => {
                let applied = match message.gossip() {
                    Ok(gossip) => self.directory.apply_gossip(&gossip).await,
                    Err(e) => Err(e.into()),
                };
                match applied {
                    Ok(()) => message.reply(IPC_SUCCESS),
                    Err(e) => {
                        warn!("Failed to apply relayed message: {}", e);
                        message.reply(IPC_ERROR)
                    }
                }
            }
            IpcMessageType::Debug => {
                debug!(message = %message.message, "IPC probe");
                message.reply(IPC_SUCCESS)
            }
            _ => message.reply(IPC_SUCCESS),
        }
    }
}

/// Child side of `.down`: publishes forwarded writes on the overlay
pub struct ChildHandler {
    publisher: GossipPublisher,
}

impl ChildHandler {
    pub fn new(publisher: GossipPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl IpcHandler for ChildHandler {
    async fn handle(&self, message: IpcMessage) -> IpcMessage {
        if message.kind != IpcMessageType::Ipc {
            return message.reply(IPC_UNKNOWN);
        }
        let gossip = match message.gossip() {
            Ok(gossip) => gossip,
            Err(e) => {
                warn!("Undecodable forwarded message: {}", e);
                return message.reply(IPC_ERROR);
            }
        };
        match self.publisher.publish(&gossip).await {
            Ok(()) => message.reply(IPC_SUCCESS),
            Err(e) => {
                warn!("Failed to publish forwarded message: {}", e);
                message.reply(IPC_ERROR)
            }
        }
    }
}

/// Start the queue subscribers for `direction` on `base`
pub async fn serve(
    bus: Arc<dyn MessageBus>,
    base: &str,
    direction: Direction,
    handler: Arc<dyn IpcHandler>,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, IpcError> {
    let subject = direction.subject(base);
    let group = direction.queue_group(base);

    let mut tasks = Vec::with_capacity(QUEUE_SUBSCRIBERS);
    for _ in 0..QUEUE_SUBSCRIBERS {
        let mut subscription = bus.queue_subscribe(&subject, &group).await?;
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let mut request = tokio::select! {
                    request = subscription.next() => match request {
                        Some(request) => request,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };

                let reply = match IpcMessage::from_bytes(&request.data) {
                    Ok(message) => handler.handle(message).await,
                    Err(e) => {
                        warn!(subject = %request.subject, "Undecodable IPC request: {}", e);
                        IpcMessage::new(IpcMessageType::Error, IPC_ERROR)
                    }
                };
                let sent = reply
                    .to_bytes()
                    .map_err(IpcError::from)
                    .and_then(|data| request.respond(data).map_err(IpcError::from));
                if let Err(e) = sent {
                    warn!(subject = %request.subject, "Failed to answer IPC request: {}", e);
                }
            }
        }));
    }

    debug!(subject = %subject, group = %group, "IPC subscribers started");
    Ok(tasks)
}
