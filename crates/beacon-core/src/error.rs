//! Error types for beacon

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// beacon core error types
#[derive(Debug, Error)]
pub enum Error {
    /// JSON encoding/decoding error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decoding error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Hex decoding error
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Message context missing
    #[error("invalid context")]
    InvalidContext,

    /// Message payload missing
    #[error("invalid payload")]
    InvalidPayload,

    /// Empty or unparseable wire data
    #[error("invalid data")]
    InvalidData,

    /// Context is not one of the directory operations
    #[error("unknown context: {0}")]
    UnknownContext(String),

    /// Malformed public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature failed to parse or verify
    #[error("invalid signature")]
    InvalidSignature,

    /// Algorithm is neither nacl nor ecdsa
    #[error("unknown signature algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Caller algorithm differs from the policy algorithm
    #[error("algorithm not matching")]
    AlgorithmMismatch,

    /// Caller key is not the one configured for the prefix
    #[error("public key not allowed")]
    PublicKeyNotAllowed,

    /// Signed timestamp outside the freshness window
    #[error("timestamp not in time range")]
    StaleTimestamp,
}
