//! Configuration for beacond

use crate::storage::{Backend, StoreOptions};
use beacon_core::TimeToLiveMode;
use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// beacond - replicated rendezvous directory daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "beacond")]
#[command(about = "Replicated rendezvous directory daemon")]
pub struct Config {
    /// Directory domain; scopes every stored key
    #[arg(long, env = "BEACON_DOMAIN", default_value = "beacon")]
    pub domain: String,

    /// Storage backend
    #[arg(long, env = "BEACON_DIRECTORY", value_enum, default_value_t = Backend::Memory)]
    pub directory: Backend,

    /// Redis URL for the redis backend
    #[arg(long, env = "BEACON_REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    pub redis_url: String,

    /// Keys held by the memory backend
    #[arg(long, default_value = "100000")]
    pub cache_capacity: usize,

    /// Seconds a memory key record survives without writes
    #[arg(long, default_value = "900")]
    pub cache_idle_secs: u64,

    /// Confidential prefix policy (YAML or JSON)
    #[arg(long, env = "BEACON_CONFIDENTIAL")]
    pub confidential: Option<PathBuf>,

    /// Seconds between policy file checks
    #[arg(long, default_value = "30")]
    pub policy_reload_secs: u64,

    /// Overlay identity seed phrase, `auto` for a random identity
    #[arg(long, env = "BEACON_P2P_SEED", default_value = "auto")]
    pub seed: String,

    /// Overlay listen address
    #[arg(short, long, default_value = "0.0.0.0:4243")]
    pub listen: SocketAddr,

    /// Overlay bootstrap peers (comma-separated addresses)
    #[arg(long, env = "BEACON_P2P_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Join the overlay even without bootstrap peers
    #[arg(long)]
    pub overlay: bool,

    /// Overlay topic and rendezvous name
    #[arg(long, env = "BEACON_P2P_ROOM", default_value = "beacon.p2p")]
    pub room: String,

    /// Base subject for parent/child messages
    #[arg(long, default_value = "beacon.ipc")]
    pub ipc_subject: String,

    /// Message bus host (served by the parent)
    #[arg(long, default_value = "127.0.0.1")]
    pub ipc_host: IpAddr,

    /// Message bus port (served by the parent)
    #[arg(long, default_value = "4222")]
    pub ipc_port: u16,

    /// Child identity offset; non-zero runs as a child
    #[arg(long, default_value = "0")]
    pub child_id: u32,

    /// Children to spawn; non-zero runs as a parent
    #[arg(long, default_value = "0")]
    pub child_count: u32,

    /// Directory key holding node announcements
    #[arg(long, default_value = "beacon.announce.nodes")]
    pub announce_key: String,

    /// Public URLs to announce (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub announce_urls: Vec<String>,

    /// Log filter directive, e.g. `debug` or `beacond=trace`
    #[arg(long, env = "BEACON_LOG")]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Process role in the fan-out topology
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Store, handler and (optionally) its own overlay identity
    Peer,
    /// Store, handler and message bus; children own the identities
    Parent { children: u32 },
    /// Overlay identity relaying to a parent's store
    Child { id: u32 },
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domain.is_empty() {
            anyhow::bail!("Domain cannot be empty");
        }
        if self.room.is_empty() {
            anyhow::bail!("Room cannot be empty");
        }
        if self.ipc_subject.is_empty() || self.ipc_subject.contains(char::is_whitespace) {
            anyhow::bail!("IPC subject must be a non-empty word");
        }
        if self.cache_capacity == 0 {
            anyhow::bail!("Cache capacity must be positive");
        }
        let longest = TimeToLiveMode::Long.duration().as_secs();
        if self.cache_idle_secs < longest {
            anyhow::bail!("Cache idle time must be at least {} seconds", longest);
        }
        if self.policy_reload_secs == 0 {
            anyhow::bail!("Policy reload interval must be positive");
        }
        if self.child_id > 0 && self.child_count > 0 {
            anyhow::bail!("A child cannot spawn children");
        }
        if matches!(self.role(), Role::Child { .. }) && self.bootstrap.is_empty() {
            anyhow::bail!("Child processes need at least one bootstrap peer");
        }
        let last_port = self.listen.port() as u32 + self.child_count;
        if last_port > u16::MAX as u32 {
            anyhow::bail!("Listen port range overflows for {} children", self.child_count);
        }
        if let Some(path) = &self.confidential {
            if !path.is_file() {
                anyhow::bail!("Confidential policy not found: {}", path.display());
            }
        }
        Ok(())
    }

    /// Role decided by the child settings
    pub fn role(&self) -> Role {
        if self.child_id > 0 {
            Role::Child { id: self.child_id }
        } else if self.child_count > 0 {
            Role::Parent {
                children: self.child_count,
            }
        } else {
            Role::Peer
        }
    }

    /// A peer joins the overlay when it has somewhere to join
    pub fn gossip_enabled(&self) -> bool {
        self.overlay || !self.bootstrap.is_empty()
    }

    pub fn ipc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ipc_host, self.ipc_port)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            backend: self.directory,
            domain: self.domain.clone(),
            capacity: self.cache_capacity,
            idle_ttl: Duration::from_secs(self.cache_idle_secs),
            redis_url: self.redis_url.clone(),
        }
    }

    /// Filter directive for the log subscriber
    pub fn log_directive(&self) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| "beacond=info".to_string())
    }

    /// Arguments for child `id` of this parent
    pub fn child_args(&self, id: u32) -> ChildArgs {
        ChildArgs {
            child_id: id,
            domain: self.domain.clone(),
            ipc_addr: self.ipc_addr(),
            ipc_subject: self.ipc_subject.clone(),
            bootstrap: self.bootstrap.clone(),
            room: self.room.clone(),
            listen: SocketAddr::new(self.listen.ip(), self.listen.port() + id as u16),
            seed: self.seed.clone(),
            log_level: self.log_directive(),
        }
    }
}

/// Command line contract between a parent and the children it spawns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildArgs {
    pub child_id: u32,
    pub domain: String,
    pub ipc_addr: SocketAddr,
    pub ipc_subject: String,
    pub bootstrap: Vec<SocketAddr>,
    pub room: String,
    pub listen: SocketAddr,
    pub seed: String,
    pub log_level: String,
}

impl ChildArgs {
    pub fn to_args(&self) -> Vec<String> {
        let bootstrap: Vec<String> = self.bootstrap.iter().map(ToString::to_string).collect();
        let mut args = vec![
            "--child-id".to_string(),
            self.child_id.to_string(),
            "--domain".to_string(),
            self.domain.clone(),
            "--ipc-host".to_string(),
            self.ipc_addr.ip().to_string(),
            "--ipc-port".to_string(),
            self.ipc_addr.port().to_string(),
            "--ipc-subject".to_string(),
            self.ipc_subject.clone(),
            "--room".to_string(),
            self.room.clone(),
            "--listen".to_string(),
            self.listen.to_string(),
            "--seed".to_string(),
            self.seed.clone(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];
        if !bootstrap.is_empty() {
            args.push("--bootstrap".to_string());
            args.push(bootstrap.join(","));
        }
        args
    }
}
