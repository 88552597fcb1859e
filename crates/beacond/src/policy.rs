//! Reloadable confidential prefix policy

use beacon_core::confidential::ConfidentialPolicy;
use beacon_core::{DirectoryEntries, DirectoryEntry};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Policy errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: beacon_core::Error,
    },
}

/// Shared, swappable policy
#[derive(Clone, Default)]
pub struct PolicyStore {
    policy: Arc<RwLock<ConfidentialPolicy>>,
    source: Option<PathBuf>,
    modified: Arc<Mutex<Option<SystemTime>>>,
}

impl PolicyStore {
    /// Policy with no rules; every name is public
    pub fn open() -> Self {
        Self::default()
    }

    pub fn from_policy(policy: ConfidentialPolicy) -> Self {
        Self {
            policy: Arc::new(RwLock::new(policy)),
            ..Default::default()
        }
    }

    /// Load a JSON policy file
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let store = Self {
            source: Some(path.to_path_buf()),
            ..Default::default()
        };
        store.reload_if_changed()?;
        Ok(store)
    }

    /// Reread the file when its modification time moved; true when swapped
    pub fn reload_if_changed(&self) -> Result<bool, PolicyError> {
        let Some(path) = &self.source else {
            return Ok(false);
        };
        let io_error = |source| PolicyError::Io {
            path: path.clone(),
            source,
        };

        let modified = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(io_error)?;
        if *self.modified.lock() == Some(modified) {
            return Ok(false);
        }

        let data = std::fs::read(path).map_err(io_error)?;
        let policy = ConfidentialPolicy::from_yaml(&data).map_err(|source| PolicyError::Parse {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), rules = policy.confidential.len(), "Loaded confidential policy");
        *self.policy.write() = policy;
        *self.modified.lock() = Some(modified);
        Ok(true)
    }

    pub fn rule_count(&self) -> usize {
        self.policy.read().confidential.len()
    }

    /// Signature check for reading `request.name`
    pub fn authorize_list(&self, request: &DirectoryEntries) -> Result<(), beacon_core::Error> {
        let policy = self.policy.read();
        match policy.lookup(&request.name, &request.public_key) {
            Some(rule) if rule.confidential => rule.verify(
                &request.public_key,
                &request.algorithm,
                &request.signed_message(),
                &request.signature,
                request.timestamp,
                now_nanos(),
            ),
            _ => Ok(()),
        }
    }

    /// Signature check for writing `entry.name`
    pub fn authorize_write(&self, entry: &DirectoryEntry) -> Result<(), beacon_core::Error> {
        let policy = self.policy.read();
        match policy.lookup(&entry.name, &entry.public_key) {
            Some(rule) if rule.readonly => rule.verify(
                &entry.public_key,
                &entry.algorithm,
                &entry.signed_message(),
                &entry.signature,
                entry.timestamp,
                now_nanos(),
            ),
            _ => Ok(()),
        }
    }

    /// Poll the policy file until shutdown
    pub fn spawn_reload(&self, every: Duration, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.source.as_ref()?;
        let store = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match store.reload_if_changed() {
                        Ok(true) => debug!("Confidential policy reloaded"),
                        Ok(false) => {}
                        // Keep serving the last good policy
                        Err(e) => warn!("Policy reload failed: {}", e),
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
        }))
    }
}

/// Current time in nanoseconds since the unix epoch
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn signer() -> (SigningKey, String) {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let public = hex::encode(key.verifying_key().to_bytes());
        (key, public)
    }

    fn policy_json(public: &str, prefix: &str) -> String {
        format!(
            r#"{{"confidential":[{{"prefix":"{}","algorithm":"nacl","publickey":"{}","confidential":true,"readonly":true}}]}}"#,
            prefix, public
        )
    }

    #[test]
    fn test_signed_write_accepted() {
        let (key, public) = signer();
        let store = PolicyStore::from_policy(
            ConfidentialPolicy::from_yaml(policy_json(&public, "admin.*").as_bytes()).unwrap(),
        );

        let mut entry = DirectoryEntry::new("admin.rooms", "value", Default::default());
        assert!(store.authorize_write(&entry).is_err());

        entry.public_key = public;
        entry.algorithm = "nacl".into();
        entry.timestamp = now_nanos();
        entry.signature = hex::encode(key.sign(entry.signed_message().as_bytes()).to_bytes());
        store.authorize_write(&entry).unwrap();

        let public_entry = DirectoryEntry::new("rooms", "value", Default::default());
        store.authorize_write(&public_entry).unwrap();
    }

    #[test]
    fn test_signed_list() {
        let (key, public) = signer();
        let store = PolicyStore::from_policy(
            ConfidentialPolicy::from_yaml(policy_json(&public, "admin.*").as_bytes()).unwrap(),
        );

        let mut request = DirectoryEntries::new("admin.rooms");
        assert!(store.authorize_list(&request).is_err());

        request.public_key = public;
        request.algorithm = "nacl".into();
        request.timestamp = now_nanos();
        request.signature = hex::encode(key.sign(request.signed_message().as_bytes()).to_bytes());
        store.authorize_list(&request).unwrap();
    }

    #[test]
    fn test_reload_on_change() {
        let (_, public) = signer();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(policy_json(&public, "a.*").as_bytes()).unwrap();
        file.flush().unwrap();

        let store = PolicyStore::load(file.path()).unwrap();
        assert_eq!(store.rule_count(), 1);
        assert!(!store.reload_if_changed().unwrap());

        let two = format!(
            r#"{{"confidential":[{{"prefix":"a.*","algorithm":"nacl","publickey":"{0}"}},{{"prefix":"b.*","algorithm":"nacl","publickey":"{0}"}}]}}"#,
            public
        );
        std::fs::write(file.path(), two).unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(file.path())
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(store.reload_if_changed().unwrap());
        assert_eq!(store.rule_count(), 2);
    }

    #[test]
    fn test_bad_reload_keeps_previous() {
        let (_, public) = signer();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(policy_json(&public, "a.*").as_bytes()).unwrap();
        file.flush().unwrap();
        let store = PolicyStore::load(file.path()).unwrap();

        std::fs::write(file.path(), b"confidential: [").unwrap();
        std::fs::File::options()
            .write(true)
            .open(file.path())
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        assert!(store.reload_if_changed().is_err());
        assert_eq!(store.rule_count(), 1);
    }

    #[test]
    fn test_load_yaml_policy() {
        let (_, public) = signer();
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "confidential:\n  - prefix: \"admin.*\"\n    algorithm: nacl\n    publickey: \"{}\"\n    readonly: true\n",
            public
        )
        .unwrap();
        file.flush().unwrap();

        let store = PolicyStore::load(file.path()).unwrap();
        assert_eq!(store.rule_count(), 1);
        let unsigned = DirectoryEntry::new("admin.rooms", "value", Default::default());
        assert!(store.authorize_write(&unsigned).is_err());
        let mut request = DirectoryEntries::new("admin.rooms");
        request.public_key = public;
        store.authorize_list(&request).unwrap();
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(matches!(
            PolicyStore::load(Path::new("/nonexistent/policy.json")),
            Err(PolicyError::Io { .. })
        ));
    }
}
