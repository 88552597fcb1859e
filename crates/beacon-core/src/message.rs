//! Gossip and IPC message envelopes
//!
//! A [`GossipMessage`] is what travels on the overlay topic: an operation
//! context plus the JSON encoding of a [`DirectoryEntry`]. An
//! [`IpcMessage`] wraps a gossip message (as JSON text) when it crosses the
//! parent/child process boundary.

use crate::error::{Error, Result};
use crate::types::DirectoryEntry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Context of a replicated `Add`
pub const CONTEXT_ADD: &str = "Directory.Add";
/// Context of a replicated `Remove`
pub const CONTEXT_REMOVE: &str = "Directory.Remove";

/// IPC reply for a handled request
pub const IPC_SUCCESS: &str = "success";
/// IPC reply for a failed request
pub const IPC_ERROR: &str = "error";
/// IPC reply for a message type the receiver does not handle
pub const IPC_UNKNOWN: &str = "unknown";

/// Directory mutation carried by a gossip message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Remove,
}

impl Operation {
    pub fn context(self) -> &'static str {
        match self {
            Self::Add => CONTEXT_ADD,
            Self::Remove => CONTEXT_REMOVE,
        }
    }

    pub fn from_context(context: &str) -> Result<Self> {
        match context {
            CONTEXT_ADD => Ok(Self::Add),
            CONTEXT_REMOVE => Ok(Self::Remove),
            other => Err(Error::UnknownContext(other.to_string())),
        }
    }
}

// =============================================================================
// GOSSIP
// =============================================================================

/// Message published on the overlay topic
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GossipMessage {
    pub context: String,
    /// Standard base64 on the wire
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl GossipMessage {
    /// Build a message by JSON-encoding `obj`
    pub fn new<T: Serialize>(context: &str, obj: &T) -> Result<Self> {
        if context.is_empty() {
            return Err(Error::InvalidContext);
        }
        Ok(Self {
            context: context.to_string(),
            payload: serde_json::to_vec(obj)?,
        })
    }

    /// Build a directory operation message
    pub fn operation(op: Operation, entry: &DirectoryEntry) -> Result<Self> {
        Self::new(op.context(), entry)
    }

    /// Decode a message received from the wire
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidData);
        }
        serde_json::from_slice(data).map_err(|_| Error::InvalidData)
    }

    /// Encode for the wire; empty context or payload is refused
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode the payload as `T`
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        self.validate()?;
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Operation and entry, when this is a directory message
    pub fn directory_op(&self) -> Result<(Operation, DirectoryEntry)> {
        let op = Operation::from_context(&self.context)?;
        let entry = self.parse_payload()?;
        Ok((op, entry))
    }

    fn validate(&self) -> Result<()> {
        if self.context.is_empty() {
            return Err(Error::InvalidContext);
        }
        if self.payload.is_empty() {
            return Err(Error::InvalidPayload);
        }
        Ok(())
    }
}

// =============================================================================
// IPC
// =============================================================================

/// Kind of an IPC message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMessageType {
    /// Liveness probes and diagnostics
    Debug,
    /// Gossip received by a child, relayed up to the parent store
    Soroban,
    /// Local write forwarded down for a child to publish
    Ipc,
    /// Receiver could not decode the request
    Error,
}

/// Request/reply envelope exchanged on `<subject>.up` and `<subject>.down`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub kind: IpcMessageType,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    /// RFC 3339 on the wire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IpcMessage {
    pub fn new(kind: IpcMessageType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: String::new(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Liveness probe
    pub fn debug(message: impl Into<String>) -> Self {
        let mut msg = Self::new(IpcMessageType::Debug, message);
        msg.payload = "{}".to_string();
        msg
    }

    /// Wrap a gossip message with the given envelope type
    pub fn wrap(kind: IpcMessageType, gossip: &GossipMessage) -> Result<Self> {
        let mut msg = Self::new(kind, "");
        msg.payload = String::from_utf8(gossip.to_bytes()?).map_err(|_| Error::InvalidData)?;
        Ok(msg)
    }

    /// Reply of the same type carrying a status word
    pub fn reply(&self, status: &str) -> Self {
        Self::new(self.kind, status)
    }

    /// Gossip message carried in the payload
    pub fn gossip(&self) -> Result<GossipMessage> {
        GossipMessage::from_bytes(self.payload.as_bytes())
    }

    pub fn is_success(&self) -> bool {
        self.message == IPC_SUCCESS
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidData);
        }
        Ok(serde_json::from_slice(data)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
