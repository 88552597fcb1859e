//! Overlay identities
//!
//! Each overlay identity is an ed25519 keypair. Operators pass a seed
//! phrase (or `auto` for a random identity); children of a fan-out parent
//! derive distinct identities from the same phrase plus their child id.

use crate::peer::PeerId;
use beacon_core::crypto::derive_identity_seed;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Seed phrase selecting a random identity
pub const AUTO_SEED: &str = "auto";

/// Domain prefix of the hello signature
const HELLO_DOMAIN: &[u8] = b"beacon-hello-v1:";

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Hello signature verification failed")]
    BadSignature,
}

/// Keypair backing one overlay identity
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Identity for `child_id` derived from an operator phrase
    pub fn from_phrase(phrase: &str, child_id: u32) -> Self {
        if phrase.is_empty() || phrase == AUTO_SEED {
            return Self::generate();
        }
        Self::from_seed(&derive_identity_seed(phrase, child_id))
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.signing_key.verifying_key().to_bytes())
    }

    /// Signed introduction sent when a connection opens
    pub fn hello(&self, listen_addr: SocketAddr) -> Hello {
        let signature = self.signing_key.sign(&Hello::signed_bytes(&listen_addr));
        Hello {
            peer_id: self.peer_id(),
            listen_addr,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

/// First frame on every overlay connection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: PeerId,
    pub listen_addr: SocketAddr,
    pub signature: Vec<u8>,
}

impl Hello {
    fn signed_bytes(listen_addr: &SocketAddr) -> Vec<u8> {
        let mut bytes = HELLO_DOMAIN.to_vec();
        bytes.extend_from_slice(listen_addr.to_string().as_bytes());
        bytes
    }

    /// Check that the sender controls the advertised identity
    pub fn verify(&self) -> Result<(), IdentityError> {
        let key = VerifyingKey::from_bytes(self.peer_id.as_bytes())
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::BadSignature)?;
        key.verify(
            &Self::signed_bytes(&self.listen_addr),
            &Signature::from_bytes(&sig_bytes),
        )
        .map_err(|_| IdentityError::BadSignature)
    }
}
