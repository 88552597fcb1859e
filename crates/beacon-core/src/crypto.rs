//! Hash derivations and signature verification
//!
//! Storage keys are scoped to a deployment domain by hashing
//! `domain || name` with SHA-256, so deployments sharing one backend never
//! collide. Overlay identity seeds are derived with BLAKE3.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey as EdVerifyingKey};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature as EcSignature, VerifyingKey as EcVerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// STORAGE KEYS
// =============================================================================

/// Prefix of the per-key value set record
pub const PREFIX_KEY: &str = "k";
/// Prefix of the per-key ordering counter record
pub const PREFIX_COUNT: &str = "c";
/// Prefix of the per-value companion record
pub const PREFIX_VALUE: &str = "v";

/// `prefix:hex(sha256(domain || value))`
pub fn hash(domain: &str, prefix: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(value.as_bytes());
    format!("{}:{}", prefix, hex::encode(hasher.finalize()))
}

pub fn key_hash(domain: &str, key: &str) -> String {
    hash(domain, PREFIX_KEY, key)
}

pub fn count_hash(domain: &str, key: &str) -> String {
    hash(domain, PREFIX_COUNT, key)
}

pub fn value_hash(domain: &str, value: &str) -> String {
    hash(domain, PREFIX_VALUE, value)
}

/// Stored set member: ordering counter prefixed onto the value
pub fn format_member(counter: u64, value: &str) -> String {
    format!("{}_{}", counter, value)
}

/// Split a stored member into `(counter, value)`
///
/// Members without a numeric prefix sort first with counter 0.
pub fn parse_member(member: &str) -> (u64, &str) {
    match member.split_once('_') {
        Some((counter, value)) => match counter.parse::<u64>() {
            Ok(counter) => (counter, value),
            Err(_) => (0, member),
        },
        None => (0, member),
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Domain prefix for overlay identity seeds
pub const DOMAIN_IDENTITY: &[u8] = b"beacon-identity-v1:";

/// Derive a 32-byte identity seed from an operator seed and a child offset
///
/// `seed = BLAKE3("beacon-identity-v1:" || phrase || child_id_le)`
pub fn derive_identity_seed(phrase: &str, child_id: u32) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DOMAIN_IDENTITY);
    hasher.update(phrase.as_bytes());
    hasher.update(&child_id.to_le_bytes());
    *hasher.finalize().as_bytes()
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// Signature schemes accepted for confidential entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    /// Ed25519 detached signature over the raw message
    Nacl,
    /// secp256k1 DER signature over double-SHA256 of the message
    Ecdsa,
}

impl FromStr for SignatureAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nacl" => Ok(Self::Nacl),
            "ecdsa" => Ok(Self::Ecdsa),
            other => Err(Error::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nacl => f.write_str("nacl"),
            Self::Ecdsa => f.write_str("ecdsa"),
        }
    }
}

/// Verify a hex-encoded signature over `message` with a hex-encoded key
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    public_key: &str,
    message: &str,
    signature: &str,
) -> Result<()> {
    match algorithm {
        SignatureAlgorithm::Nacl => verify_nacl(public_key, message, signature),
        SignatureAlgorithm::Ecdsa => verify_ecdsa(public_key, message, signature),
    }
}

fn verify_nacl(public_key: &str, message: &str, signature: &str) -> Result<()> {
    let key_bytes: [u8; 32] = hex::decode(public_key)?
        .try_into()
        .map_err(|_| Error::InvalidPublicKey("expected 32 bytes".into()))?;
    let key = EdVerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;

    let sig_bytes: [u8; 64] = hex::decode(signature)?
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let sig = EdSignature::from_bytes(&sig_bytes);

    key.verify(message.as_bytes(), &sig)
        .map_err(|_| Error::InvalidSignature)
}

fn verify_ecdsa(public_key: &str, message: &str, signature: &str) -> Result<()> {
    let key = EcVerifyingKey::from_sec1_bytes(&hex::decode(public_key)?)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;

    let sig = EcSignature::from_der(&hex::decode(signature)?)
        .map_err(|_| Error::InvalidSignature)?;
    // high-S encodings are valid on the wire but rejected by the verifier
    let sig = sig.normalize_s().unwrap_or(sig);

    let digest = Sha256::digest(Sha256::digest(message.as_bytes()));
    key.verify_prehash(&digest, &sig)
        .map_err(|_| Error::InvalidSignature)
}
