//! Redis directory
//!
//! Layout per logical key (all names hashed with the domain):
//! - `k:<key>` set of `<counter>_<value>` members
//! - `c:<k-hash>` monotonically increasing counter for the key
//! - `v:<k-hash || value>` counter assigned to one value of the key
//!
//! Only the `v:` record carries a value's own expiry. A member is live while
//! its value record exists and still holds the member's counter; `list`
//! drops every other member. Adds and removes run as server-side scripts so
//! operations on one key never interleave. The set and counter records are
//! only ever extended by an add; removing the last value shortens the
//! counter's TTL.

use super::{check_add, check_key, Directory, StatusInfo, StoreError};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, RedisError, Script};
use async_trait::async_trait;
use beacon_core::crypto::{count_hash, key_hash, parse_member, value_hash};
use std::time::Duration;
use tracing::debug;

/// Counter lifetime once its key holds no value
const EMPTY_COUNTER_TTL: u64 = 15;

/// KEYS: set, counter, value record. ARGV: value, ttl seconds
const ADD_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[2])
local counter = redis.call('GET', KEYS[3])
if not counter then
  for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local sep = string.find(member, '_', 1, true)
    if sep and string.sub(member, sep + 1) == ARGV[1] then
      redis.call('SREM', KEYS[1], member)
    end
  end
  counter = redis.call('INCR', KEYS[2])
  redis.call('SADD', KEYS[1], counter .. '_' .. ARGV[1])
end
redis.call('SET', KEYS[3], counter, 'EX', ttl)
for _, record in ipairs({KEYS[1], KEYS[2]}) do
  if redis.call('TTL', record) < ttl then
    redis.call('EXPIRE', record, ttl)
  end
end
"#;

/// KEYS: set, counter, value record. ARGV: value, empty counter ttl
const REMOVE_SCRIPT: &str = r#"
redis.call('DEL', KEYS[3])
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local sep = string.find(member, '_', 1, true)
  if sep and string.sub(member, sep + 1) == ARGV[1] then
    redis.call('SREM', KEYS[1], member)
  end
end
if redis.call('SCARD', KEYS[1]) == 0 then
  redis.call('EXPIRE', KEYS[2], ARGV[2])
end
"#;

/// Directory stored in a redis server
pub struct RedisDirectory {
    domain: String,
    conn: MultiplexedConnection,
    add_script: Script,
    remove_script: Script,
}

impl RedisDirectory {
    /// Connect and check the server answers
    pub async fn connect(url: &str, domain: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(connection_error)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(connection_error)?;

        debug!(url = %url, "Connected to redis");
        Ok(Self {
            domain: domain.to_string(),
            conn,
            add_script: Script::new(ADD_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        })
    }

    /// Record names for a key and one of its values
    fn records(&self, key: &str, value: &str) -> (String, String, String) {
        let key = key_hash(&self.domain, key);
        let counter = count_hash(&self.domain, &key);
        let value = self.value_record(&key, value);
        (key, counter, value)
    }

    fn value_record(&self, key_hash: &str, value: &str) -> String {
        value_hash(&self.domain, &format!("{}{}", key_hash, value))
    }
}

fn connection_error(e: RedisError) -> StoreError {
    StoreError::Connection(e.to_string())
}

/// Split set members into live values (oldest first) and stale members
///
/// `current[i]` is the counter held by the value record of `members[i]`.
pub(crate) fn partition_members(
    members: &[String],
    current: &[Option<u64>],
) -> (Vec<String>, Vec<String>) {
    let mut live: Vec<(u64, &str)> = Vec::new();
    let mut stale = Vec::new();

    for (member, current) in members.iter().zip(current) {
        let (counter, value) = parse_member(member);
        if *current == Some(counter) && !live.iter().any(|(_, seen)| *seen == value) {
            live.push((counter, value));
        } else {
            stale.push(member.clone());
        }
    }

    live.sort_by_key(|(counter, _)| *counter);
    let live: Vec<String> = live.into_iter().map(|(_, value)| value.to_string()).collect();
    (live, stale)
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn status(&self) -> Result<StatusInfo, StoreError> {
        let mut conn = self.conn.clone();
        let report: String = ::redis::cmd("INFO")
            .arg("all")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Status(e.to_string()))?;
        Ok(parse_info(&report))
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        check_key(key)?;
        let key = key_hash(&self.domain, key);
        let list_error = |e: RedisError| StoreError::List(e.to_string());
        let mut conn = self.conn.clone();

        let members: Vec<String> = conn.smembers(&key).await.map_err(list_error)?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let records: Vec<String> = members
            .iter()
            .map(|member| self.value_record(&key, parse_member(member).1))
            .collect();
        let current: Vec<Option<u64>> = ::redis::cmd("MGET")
            .arg(&records)
            .query_async(&mut conn)
            .await
            .map_err(list_error)?;

        let (live, stale) = partition_members(&members, &current);
        if !stale.is_empty() {
            debug!(stale = stale.len(), "Dropping expired members");
            let _: () = conn.srem(&key, &stale).await.map_err(list_error)?;
        }
        Ok(live)
    }

    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        check_add(key, value, ttl)?;
        let (key, counter_key, value_key) = self.records(key, value);
        let mut conn = self.conn.clone();

        self.add_script
            .key(&key)
            .key(&counter_key)
            .key(&value_key)
            .arg(value)
            .arg(ttl.as_secs())
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Add(e.to_string()))
    }

    async fn remove(&self, key: &str, value: &str) -> Result<(), StoreError> {
        check_key(key)?;
        if value.is_empty() {
            return Ok(());
        }
        let (key, counter_key, value_key) = self.records(key, value);
        let mut conn = self.conn.clone();

        self.remove_script
            .key(&key)
            .key(&counter_key)
            .key(&value_key)
            .arg(value)
            .arg(EMPTY_COUNTER_TTL)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Remove(e.to_string()))
    }
}

/// Split an `INFO` report into lowercase named sections
pub(crate) fn parse_info(report: &str) -> StatusInfo {
    let mut info = StatusInfo {
        raw: report.to_string(),
        ..Default::default()
    };
    let mut section: Option<String> = None;

    for line in report.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix('#') {
            let name = name.trim().replace(' ', "_").to_lowercase();
            info.section(&name);
            section = Some(name);
            continue;
        }
        let (Some(name), Some((field, value))) = (&section, line.split_once(':')) else {
            continue;
        };
        info.section(name)
            .insert(field.to_string(), value.to_string());
    }
    info
}
