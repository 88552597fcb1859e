//! Directory data model
//!
//! Field names follow the JSON wire form used by directory clients
//! (`Name`, `Entry`, `Mode`, ...). Optional fields default to empty values
//! so partially filled requests decode cleanly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Entry name used by overlay heartbeats
pub const HEARTBEAT_NAME: &str = "p2p.heartbeat";

/// Smallest TTL accepted by the storage engine
pub const MIN_TTL: Duration = Duration::from_secs(1);

// =============================================================================
// TIME TO LIVE
// =============================================================================

/// TTL policy selected by callers
///
/// This is the only way requests express a lifetime; raw durations are never
/// accepted from the RPC boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeToLiveMode {
    Fast,
    Short,
    #[default]
    #[serde(alias = "normal")]
    Default,
    Long,
}

impl TimeToLiveMode {
    /// Parse a mode name; empty and unknown names map to `Default`
    pub fn parse(mode: &str) -> Self {
        match mode {
            "fast" => Self::Fast,
            "short" => Self::Short,
            "long" => Self::Long,
            _ => Self::Default,
        }
    }

    /// Lifetime of a value stored with this mode
    pub fn duration(self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(15),
            Self::Short => Duration::from_secs(60),
            Self::Default => Duration::from_secs(3 * 60),
            Self::Long => Duration::from_secs(5 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Short => "short",
            Self::Default => "default",
            Self::Long => "long",
        }
    }
}

impl fmt::Display for TimeToLiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// A single directory write (`Add` / `Remove`), also the gossip payload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DirectoryEntry {
    pub name: String,
    pub entry: String,
    pub mode: String,
    pub public_key: String,
    pub algorithm: String,
    pub signature: String,
    /// Signing time, nanoseconds since the unix epoch
    pub timestamp: i64,
}

impl DirectoryEntry {
    /// Create an unsigned entry
    pub fn new(name: impl Into<String>, entry: impl Into<String>, mode: TimeToLiveMode) -> Self {
        Self {
            name: name.into(),
            entry: entry.into(),
            mode: mode.as_str().to_string(),
            ..Default::default()
        }
    }

    /// Heartbeat entry published on the overlay every liveness interval
    pub fn heartbeat(unix_secs: u64) -> Self {
        Self::new(HEARTBEAT_NAME, unix_secs.to_string(), TimeToLiveMode::Short)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.name == HEARTBEAT_NAME
    }

    pub fn ttl_mode(&self) -> TimeToLiveMode {
        TimeToLiveMode::parse(&self.mode)
    }

    /// Message covered by the write signature: `name.timestamp.entry`
    pub fn signed_message(&self) -> String {
        format!("{}.{}.{}", self.name, self.timestamp, self.entry)
    }
}

/// A directory read (`List`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DirectoryEntries {
    pub name: String,
    /// Maximum entries returned; zero or negative means all
    pub limit: i64,
    pub public_key: String,
    pub algorithm: String,
    pub signature: String,
    pub timestamp: i64,
}

impl DirectoryEntries {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Message covered by the read signature: `name.timestamp`
    pub fn signed_message(&self) -> String {
        format!("{}.{}", self.name, self.timestamp)
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Result of a `List`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectoryEntriesResponse {
    pub name: String,
    pub entries: Vec<String>,
}

/// Outcome reported across the RPC boundary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Success,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an `Add` / `Remove`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    pub status: Status,
}

impl Response {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
        }
    }

    pub fn error() -> Self {
        Self {
            status: Status::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
