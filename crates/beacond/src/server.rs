//! beacond server - role wiring and lifecycle

use crate::announce::{self, ANNOUNCE_EVERY};
use crate::config::{Config, Role};
use crate::directory::{Capabilities, DirectoryHandler};
use crate::gossip::{GossipError, GossipSettings, InboundSink, Replication, ReplicationOutcome};
use crate::ipc::{self, ChildHandler, Direction, IpcClient, IpcError, ParentHandler};
use crate::policy::{PolicyError, PolicyStore};
use crate::storage::{self, StoreError};
use crate::supervisor::{Supervisor, SupervisorError, START_STAGGER};
use beacon_net::{
    BusError, BusServer, Identity, MessageBus, Overlay, OverlayError, SessionRegistry, TcpBus,
    TcpOverlay,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// One beacond process in its configured role
pub struct Server {
    config: Config,
    sessions: SessionRegistry,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown or isolation, then close every session
    pub async fn run(&self) -> Result<ReplicationOutcome, ServerError> {
        let role = self.config.role();
        info!(role = ?role, domain = %self.config.domain, "Starting beacond");

        let result = match role {
            Role::Peer => self.run_peer().await,
            Role::Parent { children } => self.run_parent(children).await,
            Role::Child { id } => self.run_child(id).await,
        };

        self.shutdown.cancel();
        self.sessions.close_all().await;
        result
    }

    async fn run_peer(&self) -> Result<ReplicationOutcome, ServerError> {
        if !self.config.gossip_enabled() {
            let handler = self.handler(Capabilities::default()).await?;
            self.spawn_announce(&handler);
            info!("Running without overlay");
            self.shutdown.cancelled().await;
            return Ok(ReplicationOutcome::Shutdown);
        }

        let overlay = self.open_overlay(0).await?;
        let replication = Replication::join(overlay, self.gossip_settings()).await?;
        let handler = self
            .handler(Capabilities {
                gossip: Some(replication.publisher()),
                ipc: None,
            })
            .await?;
        self.spawn_announce(&handler);

        Ok(replication
            .run(InboundSink::Local(handler), self.shutdown.clone())
            .await?)
    }

    async fn run_parent(&self, children: u32) -> Result<ReplicationOutcome, ServerError> {
        let server = Arc::new(BusServer::bind(self.config.ipc_addr()).await?);
        self.sessions.register(server.clone());
        info!(addr = %server.local_addr(), "IPC bus listening");

        let bus: Arc<dyn MessageBus> = server;
        let client = IpcClient::new(bus.clone(), &self.config.ipc_subject);
        let handler = self
            .handler(Capabilities {
                gossip: None,
                ipc: Some(client.clone()),
            })
            .await?;

        ipc::serve(
            bus,
            &self.config.ipc_subject,
            Direction::Up,
            Arc::new(ParentHandler::new(handler.clone())),
            self.shutdown.clone(),
        )
        .await?;
        if let Err(e) = client.probe().await {
            warn!("Failed to reach IPC server: {}", e);
        }

        let args = (1..=children).map(|id| self.config.child_args(id)).collect();
        let supervised = Supervisor::current_exe()?.spawn_children(
            args,
            START_STAGGER,
            self.shutdown.clone(),
        );
        info!(children, "Children scheduled");
        self.spawn_announce(&handler);

        self.shutdown.cancelled().await;
        futures::future::join_all(supervised).await;
        Ok(ReplicationOutcome::Shutdown)
    }

    async fn run_child(&self, id: u32) -> Result<ReplicationOutcome, ServerError> {
        let bus = Arc::new(TcpBus::connect(self.config.ipc_addr()).await?);
        self.sessions.register(bus.clone());
        let bus: Arc<dyn MessageBus> = bus;

        let client = IpcClient::new(bus.clone(), &self.config.ipc_subject);
        if let Err(e) = client.probe().await {
            warn!("Failed to reach IPC server: {}", e);
        }

        let overlay = self.open_overlay(id).await?;
        let replication = Replication::join(overlay, self.gossip_settings()).await?;
        ipc::serve(
            bus,
            &self.config.ipc_subject,
            Direction::Down,
            Arc::new(ChildHandler::new(replication.publisher())),
            self.shutdown.clone(),
        )
        .await?;
        info!(child = id, "Child registered for parent requests");

        Ok(replication
            .run(InboundSink::Parent(client), self.shutdown.clone())
            .await?)
    }

    /// Store and policy behind a handler with the given replication paths
    async fn handler(&self, caps: Capabilities) -> Result<DirectoryHandler, ServerError> {
        let store = storage::open(&self.config.store_options()).await?;
        info!(backend = ?self.config.directory, "Directory opened");

        let policy = match &self.config.confidential {
            Some(path) => PolicyStore::load(path)?,
            None => PolicyStore::open(),
        };
        policy.spawn_reload(
            Duration::from_secs(self.config.policy_reload_secs),
            self.shutdown.clone(),
        );

        Ok(DirectoryHandler::new(store, policy, caps))
    }

    async fn open_overlay(&self, child_id: u32) -> Result<Arc<dyn Overlay>, ServerError> {
        let identity = Identity::from_phrase(&self.config.seed, child_id);
        let overlay = Arc::new(TcpOverlay::bind(identity, self.config.listen).await?);
        self.sessions.register(overlay.clone());
        info!(
            peer = %overlay.local_peer(),
            addr = %overlay.listen_addr(),
            "Overlay listening"
        );

        let connected = overlay.bootstrap(&self.config.bootstrap).await;
        if connected == 0 && !self.config.bootstrap.is_empty() {
            warn!("No bootstrap peer reachable");
        }
        Ok(overlay as Arc<dyn Overlay>)
    }

    fn gossip_settings(&self) -> GossipSettings {
        GossipSettings::new(&self.config.room)
    }

    fn spawn_announce(&self, handler: &DirectoryHandler) {
        if self.config.announce_urls.is_empty() {
            return;
        }
        tokio::spawn(announce::run(
            handler.clone(),
            self.config.announce_key.clone(),
            self.config.announce_urls.clone(),
            ANNOUNCE_EVERY,
            self.shutdown.clone(),
        ));
    }
}
