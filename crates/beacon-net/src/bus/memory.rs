//! In-process bus router

use super::{BusError, BusRequest, MessageBus, QueueSubscription, SUBSCRIBER_BUFFER};
use crate::session::Session;
use async_trait::async_trait;
use futures::future::select_ok;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

#[derive(Default)]
struct QueueGroup {
    members: Vec<mpsc::Sender<BusRequest>>,
    cursor: usize,
}

impl QueueGroup {
    /// Hand the request to the next member with room, round robin
    fn offer(&mut self, mut request: BusRequest) -> bool {
        self.members.retain(|tx| !tx.is_closed());
        let count = self.members.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            match self.members[index].try_send(request) {
                Ok(()) => {
                    self.cursor = (index + 1) % count;
                    return true;
                }
                Err(TrySendError::Full(back)) | Err(TrySendError::Closed(back)) => request = back,
            }
        }
        false
    }
}

/// subject -> group -> members
type Routes = HashMap<String, HashMap<String, QueueGroup>>;

/// Bus whose subscribers live in this process
#[derive(Clone, Default)]
pub struct MemoryBus {
    routes: Arc<Mutex<Routes>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand one copy of the request to each queue group on `subject`
    fn dispatch(&self, subject: &str, data: &[u8]) -> Vec<oneshot::Receiver<Vec<u8>>> {
        let mut routes = self.routes.lock();
        let Some(groups) = routes.get_mut(subject) else {
            return Vec::new();
        };

        let mut replies = Vec::new();
        for (group, queue) in groups.iter_mut() {
            let (tx, rx) = oneshot::channel();
            if queue.offer(BusRequest::new(subject.to_string(), data.to_vec(), tx)) {
                replies.push(rx);
            } else {
                trace!(subject = %subject, group = %group, "Queue group busy or empty");
            }
        }
        groups.retain(|_, queue| !queue.members.is_empty());
        if groups.is_empty() {
            routes.remove(subject);
        }
        replies
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let replies = self.dispatch(subject, &data);
        if replies.is_empty() {
            return Err(BusError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, select_ok(replies)).await {
            Ok(Ok((reply, _))) => Ok(reply),
            // Every subscriber dropped the request unanswered
            Ok(Err(_)) => Err(BusError::NoResponders(subject.to_string())),
            Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<QueueSubscription, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.routes
            .lock()
            .entry(subject.to_string())
            .or_default()
            .entry(group.to_string())
            .or_default()
            .members
            .push(tx);
        Ok(QueueSubscription::new(
            subject.to_string(),
            group.to_string(),
            rx,
        ))
    }
}

#[async_trait]
impl Session for MemoryBus {
    fn name(&self) -> String {
        "memory-bus".into()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.routes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn answer_with(mut sub: QueueSubscription, tag: &'static str) {
        tokio::spawn(async move {
            while let Some(mut request) = sub.next().await {
                request.respond(tag.as_bytes().to_vec()).unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_queue_group_round_robin() {
        let bus = MemoryBus::new();
        answer_with(bus.queue_subscribe("svc.up", "queue.svc.up").await.unwrap(), "a");
        answer_with(bus.queue_subscribe("svc.up", "queue.svc.up").await.unwrap(), "b");

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(bus.request("svc.up", vec![], TIMEOUT).await.unwrap());
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_no_responders() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.request("nobody", vec![], TIMEOUT).await,
            Err(BusError::NoResponders(_))
        ));

        let sub = bus.queue_subscribe("gone", "g").await.unwrap();
        drop(sub);
        assert!(matches!(
            bus.request("gone", vec![], TIMEOUT).await,
            Err(BusError::NoResponders(_))
        ));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let bus = MemoryBus::new();
        let _silent = bus.queue_subscribe("slow", "g").await.unwrap();
        assert!(matches!(
            bus.request("slow", vec![], Duration::from_millis(50)).await,
            Err(BusError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_respond_once() {
        let bus = MemoryBus::new();
        let mut sub = bus.queue_subscribe("once", "g").await.unwrap();
        let requester = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request("once", b"q".to_vec(), TIMEOUT).await })
        };

        let mut request = sub.next().await.unwrap();
        assert_eq!(request.data, b"q");
        request.respond(b"r".to_vec()).unwrap();
        assert!(matches!(
            request.respond(b"again".to_vec()),
            Err(BusError::AlreadyAnswered)
        ));
        assert_eq!(requester.await.unwrap().unwrap(), b"r");
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = MemoryBus::new();
        let mut sub = bus.queue_subscribe("x", "g").await.unwrap();
        bus.close().await;
        assert!(sub.next().await.is_none());
        assert!(matches!(bus.request("x", vec![], TIMEOUT).await, Err(BusError::Closed)));
    }
}
