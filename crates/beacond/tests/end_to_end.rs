//! Replication flows over the in-memory overlay and bus

use beacon_core::{DirectoryEntries, DirectoryEntry, GossipMessage, Operation, TimeToLiveMode};
use beacon_net::{Identity, MemoryBus, MemoryNetwork, MessageBus, Overlay, PeerInfo};
use beacond::directory::{Capabilities, DirectoryHandler};
use beacond::gossip::{GossipError, GossipSettings, InboundSink, Replication, ReplicationOutcome};
use beacond::ipc::{self, ChildHandler, Direction, IpcClient, ParentHandler};
use beacond::policy::PolicyStore;
use beacond::storage::MemoryDirectory;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SUBJECT: &str = "beacon.ipc";

type ReplicationTask = JoinHandle<Result<ReplicationOutcome, GossipError>>;

fn settings() -> GossipSettings {
    GossipSettings {
        discovery_every: Duration::from_millis(20),
        ..GossipSettings::new("beacon.p2p")
    }
}

fn store(caps: Capabilities) -> DirectoryHandler {
    DirectoryHandler::new(Arc::new(MemoryDirectory::default()), PolicyStore::open(), caps)
}

fn entry(name: &str, value: &str) -> DirectoryEntry {
    DirectoryEntry::new(name, value, TimeToLiveMode::Short)
}

async fn listed(handler: &DirectoryHandler, name: &str) -> Vec<String> {
    handler.list(&DirectoryEntries::new(name)).await.entries
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Standalone server with its own overlay identity
async fn peer(
    network: &MemoryNetwork,
    settings: GossipSettings,
    shutdown: &CancellationToken,
) -> (DirectoryHandler, Arc<dyn Overlay>, ReplicationTask) {
    let overlay: Arc<dyn Overlay> = Arc::new(network.node(&Identity::generate()));
    let replication = Replication::join(overlay.clone(), settings).await.unwrap();
    let handler = store(Capabilities {
        gossip: Some(replication.publisher()),
        ipc: None,
    });
    let task = tokio::spawn(replication.run(InboundSink::Local(handler.clone()), shutdown.clone()));
    (handler, overlay, task)
}

#[tokio::test]
async fn test_add_and_remove_reach_peer() {
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let (a, overlay_a, task_a) = peer(&network, settings(), &shutdown).await;
    let (b, overlay_b, task_b) = peer(&network, settings(), &shutdown).await;

    eventually(|| async { overlay_a.is_connected(&overlay_b.local_peer()) }).await;

    assert!(a.add(&entry("round.1", "alice")).await.is_success());
    eventually(|| async { listed(&b, "round.1").await == vec!["alice"] }).await;

    assert!(a.remove(&entry("round.1", "alice")).await.is_success());
    eventually(|| async { listed(&b, "round.1").await.is_empty() }).await;

    shutdown.cancel();
    assert_eq!(task_a.await.unwrap().unwrap(), ReplicationOutcome::Shutdown);
    assert_eq!(task_b.await.unwrap().unwrap(), ReplicationOutcome::Shutdown);
}

#[tokio::test]
async fn test_replayed_gossip_is_idempotent() {
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let (b, overlay_b, _task) = peer(&network, settings(), &shutdown).await;

    let sender: Arc<dyn Overlay> = Arc::new(network.node(&Identity::generate()));
    sender
        .dial(&PeerInfo::new(overlay_b.local_peer(), Vec::new()))
        .await
        .unwrap();
    let topic = sender.join("beacon.p2p").await.unwrap();

    let add = GossipMessage::operation(Operation::Add, &entry("round.2", "bob")).unwrap();
    for _ in 0..3 {
        sender.publish(&topic, add.to_bytes().unwrap()).await.unwrap();
    }
    sender
        .publish(&topic, b"not a gossip message".to_vec())
        .await
        .unwrap();
    let heartbeat = GossipMessage::operation(Operation::Add, &DirectoryEntry::heartbeat(1)).unwrap();
    sender.publish(&topic, heartbeat.to_bytes().unwrap()).await.unwrap();
    let other = GossipMessage::operation(Operation::Add, &entry("round.2", "carol")).unwrap();
    sender.publish(&topic, other.to_bytes().unwrap()).await.unwrap();

    eventually(|| async { listed(&b, "round.2").await.len() == 2 }).await;
    assert_eq!(listed(&b, "round.2").await, vec!["bob", "carol"]);
    assert!(listed(&b, beacon_core::HEARTBEAT_NAME).await.is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn test_fan_out_parent_and_child() {
    let network = MemoryNetwork::new();
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let shutdown = CancellationToken::new();

    // Parent: store and `.up` subscribers, no overlay identity
    let parent = store(Capabilities {
        gossip: None,
        ipc: Some(IpcClient::new(bus.clone(), SUBJECT)),
    });
    ipc::serve(
        bus.clone(),
        SUBJECT,
        Direction::Up,
        Arc::new(ParentHandler::new(parent.clone())),
        shutdown.clone(),
    )
    .await
    .unwrap();

    // Child: overlay identity and `.down` subscribers, no store
    let child_overlay: Arc<dyn Overlay> = Arc::new(network.node(&Identity::generate()));
    let child = Replication::join(child_overlay.clone(), settings()).await.unwrap();
    ipc::serve(
        bus.clone(),
        SUBJECT,
        Direction::Down,
        Arc::new(ChildHandler::new(child.publisher())),
        shutdown.clone(),
    )
    .await
    .unwrap();
    let up = IpcClient::new(bus.clone(), SUBJECT);
    up.probe().await.unwrap();
    let child_task = tokio::spawn(child.run(InboundSink::Parent(up), shutdown.clone()));

    // Independent server on the same overlay
    let (remote, remote_overlay, _remote_task) = peer(&network, settings(), &shutdown).await;
    eventually(|| async { child_overlay.is_connected(&remote_overlay.local_peer()) }).await;

    // Parent writes go down to the child and out to the overlay
    assert!(parent.add(&entry("round.3", "dave")).await.is_success());
    assert_eq!(listed(&parent, "round.3").await, vec!["dave"]);
    eventually(|| async { listed(&remote, "round.3").await == vec!["dave"] }).await;

    // Remote writes come in through the child and up to the parent
    assert!(remote.add(&entry("round.3", "erin")).await.is_success());
    eventually(|| async { listed(&parent, "round.3").await == vec!["dave", "erin"] }).await;

    assert!(remote.remove(&entry("round.3", "dave")).await.is_success());
    eventually(|| async { listed(&parent, "round.3").await == vec!["erin"] }).await;

    shutdown.cancel();
    assert_eq!(child_task.await.unwrap().unwrap(), ReplicationOutcome::Shutdown);
}

#[tokio::test]
async fn test_isolated_peer_stops() {
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let quick = GossipSettings {
        heartbeat_every: Duration::from_millis(50),
        initial_window: Duration::from_secs(2),
        heartbeat_window: Duration::from_millis(300),
        ..settings()
    };

    let (_a, overlay_a, task_a) = peer(&network, quick.clone(), &shutdown).await;
    let (_b, overlay_b, task_b) = peer(&network, quick, &shutdown).await;
    eventually(|| async { overlay_a.is_connected(&overlay_b.local_peer()) }).await;

    // Let heartbeats flow so the short window applies
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task_a.is_finished());

    network.isolate(&overlay_a.local_peer());
    let outcome = tokio::time::timeout(Duration::from_secs(5), task_a)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ReplicationOutcome::Isolated);

    shutdown.cancel();
    let _ = task_b.await;
}
