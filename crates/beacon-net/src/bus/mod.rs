//! Request/reply message bus with queue groups
//!
//! A request on a subject is handed to one member of every queue group
//! subscribed to it; the first reply wins. Used between a fan-out parent and
//! its children.

mod memory;
mod tcp;

pub use memory::MemoryBus;
pub use tcp::{BusServer, TcpBus};

use crate::framing::FrameError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Requests buffered per subscriber before it counts as busy
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Request on {0} timed out")]
    Timeout(String),
    #[error("No responders on {0}")]
    NoResponders(String),
    #[error("Request already answered")]
    AlreadyAnswered,
    #[error("Bus connection closed")]
    Closed,
}

/// A request delivered to a queue subscriber
#[derive(Debug)]
pub struct BusRequest {
    pub subject: String,
    pub data: Vec<u8>,
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

impl BusRequest {
    pub(crate) fn new(subject: String, data: Vec<u8>, reply: oneshot::Sender<Vec<u8>>) -> Self {
        Self {
            subject,
            data,
            reply: Some(reply),
        }
    }

    /// Answer the requester; a vanished requester is not an error
    pub fn respond(&mut self, data: Vec<u8>) -> Result<(), BusError> {
        let reply = self.reply.take().ok_or(BusError::AlreadyAnswered)?;
        let _ = reply.send(data);
        Ok(())
    }

    /// Answered already, or nobody is waiting any more
    pub(crate) fn is_abandoned(&self) -> bool {
        self.reply.as_ref().map_or(true, |reply| reply.is_closed())
    }
}

/// Member of a queue group
#[derive(Debug)]
pub struct QueueSubscription {
    subject: String,
    group: String,
    rx: mpsc::Receiver<BusRequest>,
}

impl QueueSubscription {
    pub(crate) fn new(subject: String, group: String, rx: mpsc::Receiver<BusRequest>) -> Self {
        Self { subject, group, rx }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next request; `None` once the bus is gone
    pub async fn next(&mut self) -> Option<BusRequest> {
        self.rx.recv().await
    }
}

/// Request/reply transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send a request and wait up to `timeout` for the first reply
    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    /// Join `group` on `subject`
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<QueueSubscription, BusError>;
}
