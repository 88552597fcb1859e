//! Bus over framed TCP
//!
//! [`BusServer`] is embedded in the process that owns the bus. It routes
//! through a [`MemoryBus`] and relays to remote [`TcpBus`] clients: a remote
//! queue subscription becomes one member of the server-side group, and
//! requests delivered to it travel as `Deliver`/`Reply` frames.

use super::{BusError, BusRequest, MemoryBus, MessageBus, QueueSubscription, SUBSCRIBER_BUFFER};
use crate::framing::{Frame, FrameCodec, FrameType};
use crate::session::Session;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Deadline for connecting and for subscription acknowledgements
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued per connection before senders wait
const OUTBOUND_BUFFER: usize = 256;

#[derive(Serialize, Deserialize)]
struct SubscribeBody {
    request_id: u64,
    sid: u64,
    subject: String,
    group: String,
}

#[derive(Serialize, Deserialize)]
struct UnsubscribeBody {
    sid: u64,
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    request_id: u64,
    subject: String,
    data: Vec<u8>,
    timeout_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct ResponseBody {
    request_id: u64,
    outcome: Outcome,
}

#[derive(Serialize, Deserialize)]
struct DeliverBody {
    delivery_id: u64,
    sid: u64,
    subject: String,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ReplyBody {
    delivery_id: u64,
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Outcome {
    Reply(Vec<u8>),
    Timeout,
    NoResponders,
    Closed,
}

impl Outcome {
    fn from_result(result: Result<Vec<u8>, BusError>) -> Self {
        match result {
            Ok(data) => Self::Reply(data),
            Err(BusError::Timeout(_)) => Self::Timeout,
            Err(BusError::NoResponders(_)) => Self::NoResponders,
            Err(_) => Self::Closed,
        }
    }

    fn into_result(self, subject: &str) -> Result<Vec<u8>, BusError> {
        match self {
            Self::Reply(data) => Ok(data),
            Self::Timeout => Err(BusError::Timeout(subject.to_string())),
            Self::NoResponders => Err(BusError::NoResponders(subject.to_string())),
            Self::Closed => Err(BusError::Closed),
        }
    }
}

/// Bus host accepting remote clients
#[derive(Clone)]
pub struct BusServer {
    bus: MemoryBus,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl BusServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let server = Self {
            bus: MemoryBus::new(),
            local_addr,
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(server.clone().accept_loop(listener));
        info!(addr = %local_addr, "Message bus listening");
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "Bus client connected");
                        let bus = self.bus.clone();
                        let shutdown = self.shutdown.child_token();
                        tokio::spawn(async move {
                            serve_client(bus, stream, shutdown).await;
                            debug!(remote = %remote, "Bus client disconnected");
                        });
                    }
                    Err(e) => warn!("Bus accept error: {}", e),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
    }
}

/// State of one remote client connection
struct ClientLink {
    bus: MemoryBus,
    out: mpsc::Sender<Frame>,
    /// Requests handed to the client, awaiting its reply
    pending: Arc<Mutex<HashMap<u64, BusRequest>>>,
    next_delivery: Arc<AtomicU64>,
    forwarders: HashMap<u64, JoinHandle<()>>,
}

async fn serve_client(bus: MemoryBus, stream: TcpStream, shutdown: CancellationToken) {
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
    let (out, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut link = ClientLink {
        bus,
        out,
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_delivery: Arc::new(AtomicU64::new(1)),
        forwarders: HashMap::new(),
    };

    loop {
        tokio::select! {
            next = frames.next() => match next {
                Some(Ok(frame)) => link.handle(frame).await,
                Some(Err(e)) => {
                    debug!("Bus client read failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    for (_, forwarder) in link.forwarders.drain() {
        forwarder.abort();
    }
    link.pending.lock().clear();
    writer.abort();
}

impl ClientLink {
    async fn handle(&mut self, frame: Frame) {
        let result = match frame.frame_type {
            FrameType::Subscribe => match frame.decode::<SubscribeBody>() {
                Ok(body) => self.subscribe(body).await,
                Err(e) => Err(e.into()),
            },
            FrameType::Unsubscribe => match frame.decode::<UnsubscribeBody>() {
                Ok(body) => {
                    if let Some(forwarder) = self.forwarders.remove(&body.sid) {
                        forwarder.abort();
                    }
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            FrameType::Reply => match frame.decode::<ReplyBody>() {
                Ok(body) => {
                    let request = self.pending.lock().remove(&body.delivery_id);
                    match request {
                        Some(mut request) => request.respond(body.data),
                        None => Ok(()),
                    }
                }
                Err(e) => Err(e.into()),
            },
            FrameType::Request => match frame.decode::<RequestBody>() {
                Ok(body) => {
                    self.request(body);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            other => {
                trace!("Ignoring {:?} frame from bus client", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("Bus client frame rejected: {}", e);
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        self.out.send(frame).await.map_err(|_| BusError::Closed)
    }

    async fn subscribe(&mut self, body: SubscribeBody) -> Result<(), BusError> {
        let outcome = match self.bus.queue_subscribe(&body.subject, &body.group).await {
            Ok(subscription) => {
                let forwarder = tokio::spawn(forward(
                    subscription,
                    body.sid,
                    self.out.clone(),
                    self.pending.clone(),
                    self.next_delivery.clone(),
                ));
                if let Some(previous) = self.forwarders.insert(body.sid, forwarder) {
                    previous.abort();
                }
                Outcome::Reply(Vec::new())
            }
            Err(_) => Outcome::Closed,
        };
        let ack = ResponseBody {
            request_id: body.request_id,
            outcome,
        };
        self.send(Frame::encode(FrameType::Response, &ack)?).await
    }

    fn request(&self, body: RequestBody) {
        let bus = self.bus.clone();
        let out = self.out.clone();
        tokio::spawn(async move {
            let result = bus
                .request(&body.subject, body.data, Duration::from_millis(body.timeout_ms))
                .await;
            let response = ResponseBody {
                request_id: body.request_id,
                outcome: Outcome::from_result(result),
            };
            match Frame::encode(FrameType::Response, &response) {
                Ok(frame) => {
                    let _ = out.send(frame).await;
                }
                Err(e) => warn!("Failed to encode bus response: {}", e),
            }
        });
    }
}

/// Relay requests of one server-side subscription to the remote client
async fn forward(
    mut subscription: QueueSubscription,
    sid: u64,
    out: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<u64, BusRequest>>>,
    next_delivery: Arc<AtomicU64>,
) {
    while let Some(request) = subscription.next().await {
        let delivery_id = next_delivery.fetch_add(1, Ordering::Relaxed);
        let body = DeliverBody {
            delivery_id,
            sid,
            subject: request.subject.clone(),
            data: request.data.clone(),
        };
        let frame = match Frame::encode(FrameType::Deliver, &body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode bus delivery: {}", e);
                continue;
            }
        };
        {
            let mut pending = pending.lock();
            pending.retain(|_, waiting| !waiting.is_abandoned());
            pending.insert(delivery_id, request);
        }
        if out.send(frame).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl MessageBus for BusServer {
    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        self.bus.request(subject, data, timeout).await
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<QueueSubscription, BusError> {
        self.bus.queue_subscribe(subject, group).await
    }
}

#[async_trait]
impl Session for BusServer {
    fn name(&self) -> String {
        format!("bus-server/{}", self.local_addr)
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.bus.close().await;
    }
}

struct ClientInner {
    out: mpsc::Sender<Frame>,
    subscriptions: Mutex<HashMap<u64, mpsc::Sender<BusRequest>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Connection to a remote [`BusServer`]
#[derive(Clone)]
pub struct TcpBus {
    addr: SocketAddr,
    inner: Arc<ClientInner>,
}

impl TcpBus {
    pub async fn connect(addr: SocketAddr) -> Result<Self, BusError> {
        let stream = tokio::time::timeout(CONTROL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| BusError::Timeout(addr.to_string()))??;
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (out, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);

        let inner = Arc::new(ClientInner {
            out,
            subscriptions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let io = inner.clone();
        tokio::spawn(async move {
            let writer = async {
                while let Some(frame) = out_rx.recv().await {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
            };
            let reader = async {
                while let Some(next) = frames.next().await {
                    match next {
                        Ok(frame) => io.handle(frame).await,
                        Err(e) => {
                            debug!("Bus read failed: {}", e);
                            break;
                        }
                    }
                }
            };
            tokio::select! {
                _ = writer => {}
                _ = reader => {}
                _ = io.shutdown.cancelled() => {}
            }
            io.shutdown.cancel();
            io.subscriptions.lock().clear();
            io.pending.lock().clear();
            debug!(addr = %addr, "Bus connection closed");
        });

        debug!(addr = %addr, "Connected to message bus");
        Ok(Self { addr, inner })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Register a waiter, send the frame and wait for its response
    async fn call(
        &self,
        request_id: u64,
        frame: Frame,
        timeout: Duration,
    ) -> Result<Outcome, BusError> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);
        if self.inner.out.send(frame).await.is_err() {
            self.inner.pending.lock().remove(&request_id);
            return Err(BusError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Ok(Outcome::Timeout)
            }
        }
    }
}

impl ClientInner {
    async fn handle(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Response => match frame.decode::<ResponseBody>() {
                Ok(body) => {
                    if let Some(waiter) = self.pending.lock().remove(&body.request_id) {
                        let _ = waiter.send(body.outcome);
                    }
                }
                Err(e) => debug!("Bad bus response frame: {}", e),
            },
            FrameType::Deliver => match frame.decode::<DeliverBody>() {
                Ok(body) => self.deliver(body).await,
                Err(e) => debug!("Bad bus delivery frame: {}", e),
            },
            other => trace!("Ignoring {:?} frame from bus server", other),
        }
    }

    async fn deliver(&self, body: DeliverBody) {
        let subscriber = self.subscriptions.lock().get(&body.sid).cloned();
        let Some(subscriber) = subscriber else {
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = BusRequest::new(body.subject, body.data, reply_tx);
        if subscriber.try_send(request).is_err() {
            if subscriber.is_closed() {
                self.subscriptions.lock().remove(&body.sid);
                if let Ok(frame) =
                    Frame::encode(FrameType::Unsubscribe, &UnsubscribeBody { sid: body.sid })
                {
                    let _ = self.out.send(frame).await;
                }
            }
            return;
        }

        let out = self.out.clone();
        let delivery_id = body.delivery_id;
        tokio::spawn(async move {
            if let Ok(data) = reply_rx.await {
                match Frame::encode(FrameType::Reply, &ReplyBody { delivery_id, data }) {
                    Ok(frame) => {
                        let _ = out.send(frame).await;
                    }
                    Err(e) => warn!("Failed to encode bus reply: {}", e),
                }
            }
        });
    }
}

#[async_trait]
impl MessageBus for TcpBus {
    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let request_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::encode(
            FrameType::Request,
            &RequestBody {
                request_id,
                subject: subject.to_string(),
                data,
                timeout_ms: timeout.as_millis() as u64,
            },
        )?;
        self.call(request_id, frame, timeout).await?.into_result(subject)
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<QueueSubscription, BusError> {
        let sid = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.subscriptions.lock().insert(sid, tx);

        let frame = Frame::encode(
            FrameType::Subscribe,
            &SubscribeBody {
                request_id,
                sid,
                subject: subject.to_string(),
                group: group.to_string(),
            },
        )?;
        let acked = self
            .call(request_id, frame, CONTROL_TIMEOUT)
            .await
            .and_then(|outcome| outcome.into_result(subject));
        if let Err(e) = acked {
            self.inner.subscriptions.lock().remove(&sid);
            return Err(e);
        }

        Ok(QueueSubscription::new(
            subject.to_string(),
            group.to_string(),
            rx,
        ))
    }
}

#[async_trait]
impl Session for TcpBus {
    fn name(&self) -> String {
        format!("bus-client/{}", self.addr)
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
    }
}
