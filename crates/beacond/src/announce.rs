//! Periodic node announcements

use crate::directory::DirectoryHandler;
use beacon_core::{DirectoryEntry, TimeToLiveMode};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Announcement period
pub const ANNOUNCE_EVERY: Duration = Duration::from_secs(15);

/// Value stored under the announce key
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnnounceInfo {
    pub version: String,
    pub url: String,
}

/// Entries announcing each of `urls` under `key`
pub fn announcements(key: &str, version: &str, urls: &[String]) -> Vec<DirectoryEntry> {
    urls.iter()
        .filter_map(|url| {
            let info = AnnounceInfo {
                version: version.to_string(),
                url: url.clone(),
            };
            match serde_json::to_string(&info) {
                Ok(value) => Some(DirectoryEntry::new(key, value, TimeToLiveMode::Short)),
                Err(e) => {
                    warn!(url = %url, "Failed to encode announcement: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Add our announcements through the handler until shutdown
pub async fn run(
    handler: DirectoryHandler,
    key: String,
    urls: Vec<String>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let entries = announcements(&key, env!("CARGO_PKG_VERSION"), &urls);
    let mut ticker = interval_at(Instant::now() + every, every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for entry in &entries {
                    debug!(key = %key, entry = %entry.entry, "Announce");
                    if !handler.add(entry).await.is_success() {
                        warn!(key = %key, "Failed to announce to directory");
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("Announce loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Capabilities;
    use crate::policy::PolicyStore;
    use crate::storage::MemoryDirectory;
    use beacon_core::DirectoryEntries;
    use std::sync::Arc;

    #[test]
    fn test_announcement_value() {
        let entries = announcements("nodes", "1.2.3", &["http://a.onion/rpc".to_string()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "nodes");
        assert_eq!(entries[0].ttl_mode(), TimeToLiveMode::Short);
        assert_eq!(
            entries[0].entry,
            r#"{"version":"1.2.3","url":"http://a.onion/rpc"}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_adds_every_url() {
        let handler = DirectoryHandler::new(
            Arc::new(MemoryDirectory::default()),
            PolicyStore::open(),
            Capabilities::default(),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            handler.clone(),
            "nodes".into(),
            vec!["http://a".into(), "http://b".into()],
            ANNOUNCE_EVERY,
            shutdown.clone(),
        ));

        tokio::time::sleep(ANNOUNCE_EVERY + Duration::from_secs(1)).await;
        let listed = handler.list(&DirectoryEntries::new("nodes")).await.entries;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].contains("http://a"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
