//! Directory storage engines
//!
//! A directory maps a key to an insertion-ordered set of string values,
//! each with its own expiry. Keys are hashed together with the deployment
//! domain before they reach the backend.

mod memory;
mod redis;

pub use self::memory::MemoryDirectory;
pub use self::redis::RedisDirectory;

use async_trait::async_trait;
use beacon_core::types::{TimeToLiveMode, MIN_TTL};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid arguments")]
    InvalidArgs,
    #[error("List failed: {0}")]
    List(String),
    #[error("Add failed: {0}")]
    Add(String),
    #[error("Remove failed: {0}")]
    Remove(String),
    #[error("Status failed: {0}")]
    Status(String),
    #[error("Backend connection failed: {0}")]
    Connection(String),
}

/// Backend snapshot, grouped in named sections of string fields
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    #[serde(flatten)]
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
    /// Unparsed backend report
    #[serde(rename = "_raw", skip_serializing_if = "String::is_empty")]
    pub raw: String,
}

/// Sections safe to expose publicly
const PUBLIC_SECTIONS: &[&str] = &["cpu", "clients", "keyspace", "memory", "stats"];
/// Sections returned when no filter is given
const DEFAULT_SECTIONS: &[&str] = &["cpu", "clients", "keyspace"];

impl StatusInfo {
    pub fn section(&mut self, name: &str) -> &mut BTreeMap<String, String> {
        self.sections.entry(name.to_string()).or_default()
    }

    /// Public view selected by `filters`
    ///
    /// `default` selects cpu, clients and keyspace; a section name adds that
    /// public section; `*` selects every public section and `debug_all`
    /// the complete report.
    pub fn filtered(&self, filters: &[&str]) -> StatusInfo {
        let pick = |names: &[&str]| StatusInfo {
            sections: self
                .sections
                .iter()
                .filter(|(name, _)| names.contains(&name.as_str()))
                .map(|(name, fields)| (name.clone(), fields.clone()))
                .collect(),
            raw: String::new(),
        };

        let filters = if filters.is_empty() { &["default"][..] } else { filters };
        let mut result = StatusInfo::default();
        for filter in filters {
            match *filter {
                "default" => result = pick(DEFAULT_SECTIONS),
                "*" => result = pick(PUBLIC_SECTIONS),
                "debug_all" => result = self.clone(),
                name if PUBLIC_SECTIONS.contains(&name) => {
                    if let Some(fields) = self.sections.get(name) {
                        result.sections.insert(name.to_string(), fields.clone());
                    }
                }
                _ => {}
            }
        }
        result
    }
}

/// A TTL-bounded multi-valued key store
#[async_trait]
pub trait Directory: Send + Sync {
    /// Backend snapshot; never mutates
    async fn status(&self) -> Result<StatusInfo, StoreError>;

    fn time_to_live(&self, mode: &str) -> Duration {
        TimeToLiveMode::parse(mode).duration()
    }

    /// Live values of `key`, oldest insertion first
    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Insert `value` or refresh its expiry in place
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Drop `value`; absent keys and values are fine
    async fn remove(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

pub(crate) fn check_add(key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
    if key.is_empty() || value.is_empty() || ttl < MIN_TTL {
        return Err(StoreError::InvalidArgs);
    }
    Ok(())
}

pub(crate) fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgs);
    }
    Ok(())
}

/// Selectable storage backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

/// Settings shared by both backends
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub backend: Backend,
    pub domain: String,
    pub capacity: usize,
    pub idle_ttl: Duration,
    pub redis_url: String,
}

/// Open the configured backend
pub async fn open(options: &StoreOptions) -> Result<Arc<dyn Directory>, StoreError> {
    Ok(match options.backend {
        Backend::Memory => Arc::new(MemoryDirectory::new(
            &options.domain,
            options.capacity,
            options.idle_ttl,
        )),
        Backend::Redis => Arc::new(RedisDirectory::connect(&options.redis_url, &options.domain).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusInfo {
        let mut info = StatusInfo::default();
        for name in ["cpu", "clients", "keyspace", "memory", "server"] {
            info.section(name).insert("field".into(), name.into());
        }
        info.raw = "raw".into();
        info
    }

    fn names(info: &StatusInfo) -> Vec<&str> {
        info.sections.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_status_filters() {
        let info = sample();
        assert_eq!(names(&info.filtered(&[])), vec!["clients", "cpu", "keyspace"]);
        assert_eq!(names(&info.filtered(&["memory"])), vec!["memory"]);
        assert_eq!(
            names(&info.filtered(&["default", "memory"])),
            vec!["clients", "cpu", "keyspace", "memory"]
        );
        assert_eq!(
            names(&info.filtered(&["*"])),
            vec!["clients", "cpu", "keyspace", "memory"]
        );
        assert!(info.filtered(&["*"]).raw.is_empty());
        assert_eq!(info.filtered(&["debug_all"]), info);
        assert!(names(&info.filtered(&["server"])).is_empty());
    }

    #[test]
    fn test_argument_checks() {
        assert!(check_add("k", "v", Duration::from_secs(1)).is_ok());
        assert!(matches!(check_add("", "v", MIN_TTL), Err(StoreError::InvalidArgs)));
        assert!(matches!(check_add("k", "", MIN_TTL), Err(StoreError::InvalidArgs)));
        assert!(matches!(
            check_add("k", "v", Duration::from_millis(999)),
            Err(StoreError::InvalidArgs)
        ));
        assert!(check_key("").is_err());
    }
}
