//! Prefix policy for signed directory access
//!
//! A policy is a list of wildcard name patterns, each bound to one public
//! key and signature algorithm. `confidential` patterns require a signature
//! to list; `readonly` patterns require a signature to add or remove.

use crate::crypto::{verify_signature, SignatureAlgorithm};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Accepted distance between a signed timestamp and now
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// One policy rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialEntry {
    /// Name pattern, `*` matches any run of characters
    pub prefix: String,
    pub algorithm: String,
    /// Hex-encoded public key
    #[serde(rename = "publickey")]
    pub public_key: String,
    /// Reads require a signature
    #[serde(default)]
    pub confidential: bool,
    /// Writes require a signature
    #[serde(default)]
    pub readonly: bool,
}

impl ConfidentialEntry {
    /// Rules missing a pattern, key or algorithm never block anything
    pub fn is_enforced(&self) -> bool {
        !self.prefix.is_empty() && !self.algorithm.is_empty() && !self.public_key.is_empty()
    }

    /// Check a caller signature against this rule
    ///
    /// `timestamp_ns` is the signed timestamp and `now_ns` the local clock,
    /// both in nanoseconds since the unix epoch.
    pub fn verify(
        &self,
        public_key: &str,
        algorithm: &str,
        message: &str,
        signature: &str,
        timestamp_ns: i64,
        now_ns: i64,
    ) -> Result<()> {
        if !self.is_enforced() {
            return Ok(());
        }
        if public_key != self.public_key {
            return Err(Error::PublicKeyNotAllowed);
        }

        let window = FRESHNESS_WINDOW.as_nanos() as i64;
        if timestamp_ns <= now_ns - window || timestamp_ns >= now_ns + window {
            return Err(Error::StaleTimestamp);
        }

        let expected: SignatureAlgorithm = self.algorithm.parse()?;
        if algorithm != self.algorithm {
            return Err(Error::AlgorithmMismatch);
        }
        verify_signature(expected, public_key, message, signature)
    }
}

/// Full policy document
///
/// ```yaml
/// confidential:
///   - prefix: "private.*"
///     algorithm: nacl
///     publickey: "..."
///     confidential: true
///     readonly: true
/// ```
///
/// The equivalent JSON document parses as well.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialPolicy {
    #[serde(default)]
    pub confidential: Vec<ConfidentialEntry>,
}

impl ConfidentialPolicy {
    /// Parse a YAML (or JSON) policy; an empty document is an empty policy
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_slice(data)?)
    }

    pub fn is_empty(&self) -> bool {
        self.confidential.is_empty()
    }

    /// Rule governing `name` for a caller presenting `public_key`
    ///
    /// Among the rules whose pattern matches, the last one bound to the
    /// caller's key wins; otherwise the first match applies.
    pub fn lookup(&self, name: &str, public_key: &str) -> Option<&ConfidentialEntry> {
        let matching = || {
            self.confidential
                .iter()
                .filter(|entry| wildcard_match(&entry.prefix, name))
        };

        let first = matching().next();
        if public_key.is_empty() {
            return first;
        }
        matching()
            .filter(|entry| entry.public_key == public_key)
            .last()
            .or(first)
    }
}

/// Anchored match where `*` stands for any (possibly empty) substring
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let (head, tail) = (parts[0], parts[parts.len() - 1]);
    if value.len() < head.len() + tail.len() || !value.starts_with(head) || !value.ends_with(tail)
    {
        return false;
    }

    let mut rest = &value[head.len()..value.len() - tail.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    const NOW: i64 = 1_700_000_000_000_000_000;

    fn signed_rule() -> (SigningKey, ConfidentialEntry) {
        let signing = SigningKey::from_bytes(&[3u8; 32]);
        let rule = ConfidentialEntry {
            prefix: "private.*".into(),
            algorithm: "nacl".into(),
            public_key: hex::encode(signing.verifying_key().to_bytes()),
            confidential: true,
            readonly: true,
        };
        (signing, rule)
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("rooms", "rooms"));
        assert!(!wildcard_match("rooms", "rooms.1"));
        assert!(wildcard_match("rooms.*", "rooms.1"));
        assert!(wildcard_match("rooms.*", "rooms."));
        assert!(!wildcard_match("rooms.*", "room"));
        assert!(wildcard_match("*.admin", "x.y.admin"));
        assert!(wildcard_match("a*b*c", "a-b-c"));
        assert!(!wildcard_match("a*b*c", "a-c-b"));
        assert!(wildcard_match("*", ""));
        assert!(!wildcard_match("ab*ba", "aba"));
    }

    #[test]
    fn test_policy_lookup() {
        let policy = ConfidentialPolicy::from_yaml(
            br#"{"confidential":[
                {"prefix":"private.*","algorithm":"nacl","publickey":"aa","readonly":true},
                {"prefix":"private.*","algorithm":"nacl","publickey":"bb","confidential":true}
            ]}"#,
        )
        .unwrap();

        assert!(policy.lookup("public.1", "aa").is_none());
        assert_eq!(policy.lookup("private.1", "").unwrap().public_key, "aa");
        assert_eq!(policy.lookup("private.1", "bb").unwrap().public_key, "bb");
        assert_eq!(policy.lookup("private.1", "cc").unwrap().public_key, "aa");
    }

    #[test]
    fn test_lookup_last_rule_for_key_wins() {
        let policy = ConfidentialPolicy::from_yaml(
            b"confidential:
  - prefix: \"private.*\"
    algorithm: nacl
    publickey: aa
    readonly: true
  - prefix: \"private.room.*\"
    algorithm: nacl
    publickey: aa
    confidential: true
",
        )
        .unwrap();

        let rule = policy.lookup("private.room.1", "aa").unwrap();
        assert!(rule.confidential);
        assert!(!rule.readonly);
        assert!(policy.lookup("private.room.1", "").unwrap().readonly);
        assert!(policy.lookup("private.other", "aa").unwrap().readonly);
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy = ConfidentialPolicy::from_yaml(
            b"confidential:
  - prefix: admin.*
    algorithm: ecdsa
    publickey: 02ab
    readonly: true
",
        )
        .unwrap();
        assert_eq!(policy.confidential.len(), 1);
        assert_eq!(policy.confidential[0].public_key, "02ab");
        assert!(!policy.confidential[0].confidential);

        assert!(ConfidentialPolicy::from_yaml(b"").unwrap().is_empty());
        assert!(ConfidentialPolicy::from_yaml(b"confidential: [").is_err());
    }

    #[test]
    fn test_verify_signed_request() {
        let (signing, rule) = signed_rule();
        let message = format!("private.room.{}.value", NOW);
        let signature = hex::encode(signing.sign(message.as_bytes()).to_bytes());

        rule.verify(&rule.public_key, "nacl", &message, &signature, NOW, NOW)
            .unwrap();

        assert!(matches!(
            rule.verify("00", "nacl", &message, &signature, NOW, NOW),
            Err(Error::PublicKeyNotAllowed)
        ));
        assert!(matches!(
            rule.verify(&rule.public_key, "ecdsa", &message, &signature, NOW, NOW),
            Err(Error::AlgorithmMismatch)
        ));
        assert!(matches!(
            rule.verify(&rule.public_key, "nacl", "other", &signature, NOW, NOW),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_verify_freshness_window() {
        let (signing, rule) = signed_rule();
        let day = FRESHNESS_WINDOW.as_nanos() as i64;
        let stale = NOW - day - 1;
        let message = format!("private.room.{}.value", stale);
        let signature = hex::encode(signing.sign(message.as_bytes()).to_bytes());

        assert!(matches!(
            rule.verify(&rule.public_key, "nacl", &message, &signature, stale, NOW),
            Err(Error::StaleTimestamp)
        ));

        let future = NOW + day + 1;
        assert!(matches!(
            rule.verify(&rule.public_key, "nacl", &message, &signature, future, NOW),
            Err(Error::StaleTimestamp)
        ));
    }

    #[test]
    fn test_unenforced_rule_allows() {
        let rule = ConfidentialEntry {
            prefix: "x.*".into(),
            ..Default::default()
        };
        assert!(rule.verify("", "", "", "", 0, NOW).is_ok());
    }
}
