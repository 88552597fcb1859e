//! Directory request handler
//!
//! Every client operation goes through [`DirectoryHandler`]: access checks
//! against the confidential policy, the local store, then replication of
//! writes. Which replication paths exist is decided once at startup through
//! [`Capabilities`].

use crate::gossip::GossipPublisher;
use crate::ipc::{IpcClient, IpcError};
use crate::policy::PolicyStore;
use crate::storage::{Directory, StatusInfo, StoreError};
use beacon_core::{
    DirectoryEntries, DirectoryEntriesResponse, DirectoryEntry, GossipMessage, Operation, Response,
};
use rand::seq::SliceRandom;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Handler errors
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("Access denied: {0}")]
    Denied(beacon_core::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Forward failed: {0}")]
    Forward(#[from] IpcError),
    #[error("Undecodable message: {0}")]
    Decode(#[from] beacon_core::Error),
}

/// Replication paths available to the handler
#[derive(Clone, Default)]
pub struct Capabilities {
    /// Own overlay identity
    pub gossip: Option<GossipPublisher>,
    /// Children that publish on our behalf
    pub ipc: Option<IpcClient>,
}

/// Directory operations exposed to the RPC front end
#[derive(Clone)]
pub struct DirectoryHandler {
    store: Arc<dyn Directory>,
    policy: PolicyStore,
    caps: Capabilities,
}

impl DirectoryHandler {
    pub fn new(store: Arc<dyn Directory>, policy: PolicyStore, caps: Capabilities) -> Self {
        Self { store, policy, caps }
    }

    pub fn store(&self) -> &Arc<dyn Directory> {
        &self.store
    }

    /// Values under `request.name`; denied or failed reads come back empty
    pub async fn list(&self, request: &DirectoryEntries) -> DirectoryEntriesResponse {
        let entries = match self.try_list(request).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(name = %request.name, "List refused: {}", e);
                Vec::new()
            }
        };
        DirectoryEntriesResponse {
            name: request.name.clone(),
            entries,
        }
    }

    pub async fn try_list(&self, request: &DirectoryEntries) -> Result<Vec<String>, FacadeError> {
        self.policy
            .authorize_list(request)
            .map_err(FacadeError::Denied)?;
        let mut entries = self.store.list(&request.name).await?;

        let limit = usize::try_from(request.limit).unwrap_or(0);
        if limit > 0 && limit < entries.len() {
            entries.shuffle(&mut rand::thread_rng());
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub async fn add(&self, entry: &DirectoryEntry) -> Response {
        status_of("Add", entry, self.try_add(entry).await)
    }

    pub async fn remove(&self, entry: &DirectoryEntry) -> Response {
        status_of("Remove", entry, self.try_remove(entry).await)
    }

    /// Store `entry` locally, then replicate it
    pub async fn try_add(&self, entry: &DirectoryEntry) -> Result<(), FacadeError> {
        self.policy
            .authorize_write(entry)
            .map_err(FacadeError::Denied)?;
        let ttl = self.store.time_to_live(&entry.mode);
        self.store.add(&entry.name, &entry.entry, ttl).await?;
        self.replicate(Operation::Add, entry).await
    }

    pub async fn try_remove(&self, entry: &DirectoryEntry) -> Result<(), FacadeError> {
        self.policy
            .authorize_write(entry)
            .map_err(FacadeError::Denied)?;
        self.store.remove(&entry.name, &entry.entry).await?;
        self.replicate(Operation::Remove, entry).await
    }

    /// Public view of the backend status
    pub async fn status(&self, filters: &[&str]) -> Result<StatusInfo, FacadeError> {
        Ok(self.store.status().await?.filtered(filters))
    }

    /// Apply a write received from another server; no signature check and
    /// no further replication
    pub async fn apply(&self, op: Operation, entry: &DirectoryEntry) -> Result<(), FacadeError> {
        if entry.is_heartbeat() {
            return Ok(());
        }
        trace!(op = ?op, name = %entry.name, "Applying replicated write");
        match op {
            Operation::Add => {
                let ttl = self.store.time_to_live(&entry.mode);
                self.store.add(&entry.name, &entry.entry, ttl).await?;
            }
            Operation::Remove => self.store.remove(&entry.name, &entry.entry).await?,
        }
        Ok(())
    }

    /// Decode and apply a gossip message
    pub async fn apply_gossip(&self, message: &GossipMessage) -> Result<(), FacadeError> {
        let (op, entry) = message.directory_op()?;
        self.apply(op, &entry).await
    }

    async fn replicate(&self, op: Operation, entry: &DirectoryEntry) -> Result<(), FacadeError> {
        if let Some(ipc) = &self.caps.ipc {
            ipc.forward_down(op, entry).await?;
        }
        if let Some(gossip) = &self.caps.gossip {
            // Stored already; peers catch up on the next write
            if let Err(e) = gossip.publish_op(op, entry).await {
                warn!(name = %entry.name, "Failed to publish {:?}: {}", op, e);
            }
        }
        Ok(())
    }
}

fn status_of(op: &str, entry: &DirectoryEntry, result: Result<(), FacadeError>) -> Response {
    match result {
        Ok(()) => Response::success(),
        Err(e) => {
            debug!(name = %entry.name, "{} failed: {}", op, e);
            Response::error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{serve, ChildHandler, Direction};
    use crate::storage::MemoryDirectory;
    use beacon_core::confidential::ConfidentialPolicy;
    use beacon_core::TimeToLiveMode;
    use beacon_net::{Identity, MemoryBus, MemoryNetwork, MessageBus, Overlay};
    use ed25519_dalek::{Signer, SigningKey};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn local() -> DirectoryHandler {
        DirectoryHandler::new(
            Arc::new(MemoryDirectory::default()),
            PolicyStore::open(),
            Capabilities::default(),
        )
    }

    fn entry(name: &str, value: &str) -> DirectoryEntry {
        DirectoryEntry::new(name, value, TimeToLiveMode::Short)
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let handler = local();
        assert!(handler.add(&entry("room", "a")).await.is_success());
        assert!(handler.add(&entry("room", "b")).await.is_success());

        let listed = handler.list(&DirectoryEntries::new("room")).await;
        assert_eq!(listed.name, "room");
        assert_eq!(listed.entries, vec!["a", "b"]);

        assert!(handler.remove(&entry("room", "a")).await.is_success());
        assert_eq!(
            handler.list(&DirectoryEntries::new("room")).await.entries,
            vec!["b"]
        );
    }

    #[tokio::test]
    async fn test_invalid_write_is_error_status() {
        let handler = local();
        assert!(!handler.add(&entry("room", "")).await.is_success());
        assert!(!handler.add(&entry("", "v")).await.is_success());

        let listed = handler.list(&DirectoryEntries::new("")).await;
        assert!(listed.entries.is_empty());
        let json = serde_json::to_string(&listed).unwrap();
        assert!(json.contains(r#""Entries":[]"#));
    }

    #[tokio::test]
    async fn test_limit_samples_entries() {
        let handler = local();
        for value in ["a", "b", "c", "d", "e"] {
            handler.add(&entry("room", value)).await;
        }

        let mut request = DirectoryEntries::new("room");
        request.limit = 2;
        let sampled = handler.list(&request).await.entries;
        assert_eq!(sampled.len(), 2);
        assert!(sampled.iter().all(|v| ["a", "b", "c", "d", "e"].contains(&v.as_str())));

        request.limit = 10;
        assert_eq!(handler.list(&request).await.entries.len(), 5);
        request.limit = -1;
        assert_eq!(handler.list(&request).await.entries, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_confidential_prefix() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let public = hex::encode(key.verifying_key().to_bytes());
        let json = format!(
            r#"{{"confidential":[{{"prefix":"vault.*","algorithm":"nacl","publickey":"{}","confidential":true,"readonly":true}}]}}"#,
            public
        );
        let handler = DirectoryHandler::new(
            Arc::new(MemoryDirectory::default()),
            PolicyStore::from_policy(ConfidentialPolicy::from_yaml(json.as_bytes()).unwrap()),
            Capabilities::default(),
        );

        assert!(!handler.add(&entry("vault.x", "secret")).await.is_success());

        let mut signed = entry("vault.x", "secret");
        signed.public_key = public.clone();
        signed.algorithm = "nacl".into();
        signed.timestamp = crate::policy::now_nanos();
        signed.signature = hex::encode(key.sign(signed.signed_message().as_bytes()).to_bytes());
        assert!(handler.add(&signed).await.is_success());

        assert!(handler.list(&DirectoryEntries::new("vault.x")).await.entries.is_empty());

        let mut request = DirectoryEntries::new("vault.x");
        request.public_key = public;
        request.algorithm = "nacl".into();
        request.timestamp = crate::policy::now_nanos();
        request.signature = hex::encode(key.sign(request.signed_message().as_bytes()).to_bytes());
        assert_eq!(handler.list(&request).await.entries, vec!["secret"]);
    }

    #[tokio::test]
    async fn test_apply_skips_heartbeat() {
        let handler = local();
        handler
            .apply(Operation::Add, &DirectoryEntry::heartbeat(1))
            .await
            .unwrap();
        assert!(handler
            .list(&DirectoryEntries::new(beacon_core::HEARTBEAT_NAME))
            .await
            .entries
            .is_empty());

        let message = GossipMessage::operation(Operation::Add, &entry("room", "a")).unwrap();
        handler.apply_gossip(&message).await.unwrap();
        handler.apply_gossip(&message).await.unwrap();
        assert_eq!(
            handler.list(&DirectoryEntries::new("room")).await.entries,
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn test_add_publishes_to_overlay() {
        let network = MemoryNetwork::new();
        let node: Arc<dyn Overlay> = Arc::new(network.node(&Identity::generate()));
        let topic = node.join("room").await.unwrap();
        let mut sub = node.subscribe(&topic).await.unwrap();

        let handler = DirectoryHandler::new(
            Arc::new(MemoryDirectory::default()),
            PolicyStore::open(),
            Capabilities {
                gossip: Some(GossipPublisher::new(node, topic)),
                ipc: None,
            },
        );
        assert!(handler.add(&entry("room", "a")).await.is_success());

        let received = sub.next().await.unwrap();
        let (op, replicated) = GossipMessage::from_bytes(&received.data)
            .unwrap()
            .directory_op()
            .unwrap();
        assert_eq!(op, Operation::Add);
        assert_eq!(replicated.entry, "a");
    }

    #[tokio::test]
    async fn test_parent_without_children_reports_error() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let handler = DirectoryHandler::new(
            Arc::new(MemoryDirectory::default()),
            PolicyStore::open(),
            Capabilities {
                gossip: None,
                ipc: Some(IpcClient::new(bus, "test.ipc").with_timeout(Duration::from_millis(200))),
            },
        );
        assert!(!handler.add(&entry("room", "a")).await.is_success());
        // The local write stands
        assert_eq!(
            handler.list(&DirectoryEntries::new("room")).await.entries,
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn test_parent_forwards_to_child() {
        let network = MemoryNetwork::new();
        let child: Arc<dyn Overlay> = Arc::new(network.node(&Identity::generate()));
        let topic = child.join("room").await.unwrap();
        let mut sub = child.subscribe(&topic).await.unwrap();

        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let shutdown = CancellationToken::new();
        serve(
            bus.clone(),
            "test.ipc",
            Direction::Down,
            Arc::new(ChildHandler::new(GossipPublisher::new(child, topic))),
            shutdown.clone(),
        )
        .await
        .unwrap();

        let handler = DirectoryHandler::new(
            Arc::new(MemoryDirectory::default()),
            PolicyStore::open(),
            Capabilities {
                gossip: None,
                ipc: Some(IpcClient::new(bus, "test.ipc")),
            },
        );
        assert!(handler.remove(&entry("room", "a")).await.is_success());

        let received = sub.next().await.unwrap();
        let (op, _) = GossipMessage::from_bytes(&received.data)
            .unwrap()
            .directory_op()
            .unwrap();
        assert_eq!(op, Operation::Remove);
        shutdown.cancel();
    }
}
