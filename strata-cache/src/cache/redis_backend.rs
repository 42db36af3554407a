//! Redis remote level.
//!
//! Values are stored as JSON under `{namespace}:{segment}:{key}` with a
//! Redis-side expiry, so entries written by one process can be reused by
//! every other process sharing the namespace.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::RemoteBackend;
use crate::core::{MAX_TTL, Result};

/// Keys deleted per `DEL` while clearing a scope
const CLEAR_BATCH: usize = 500;

/// Redis-backed remote level scoped to a key prefix
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect to `url`; every key is prefixed with `{namespace}:`
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(namespace = %namespace, "Connected to Redis remote cache level");

        Ok(Self {
            conn,
            prefix: scoped_prefix("", namespace),
        })
    }

    /// Handle sharing the connection, restricted to `{prefix}{scope}:`
    pub fn scoped(&self, scope: &str) -> Self {
        Self {
            conn: self.conn.clone(),
            prefix: scoped_prefix(&self.prefix, scope),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn scoped_prefix(parent: &str, scope: &str) -> String {
    format!("{parent}{scope}:")
}

/// Redis `SETEX` takes whole seconds; round up, never go below one
/// and never past `MAX_TTL`
fn expiry_secs(ttl: Duration) -> u64 {
    let ttl = ttl.min(MAX_TTL);
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl<V> RemoteBackend<V> for RedisBackend
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(self.key(key)).await?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_vec(&value)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(self.key(key), payload, expiry_secs(ttl)).await?;
        debug!(key = %key, ttl_secs = expiry_secs(ttl), "Redis SET");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(CLEAR_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                let _: () = conn.del(keys).await?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %self.prefix, removed, "Redis CLEAR");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_prefix() {
        let namespace = scoped_prefix("", "strata");
        assert_eq!(namespace, "strata:");
        assert_eq!(scoped_prefix(&namespace, "posts"), "strata:posts:");
    }

    #[test]
    fn test_expiry_secs_rounds_up() {
        assert_eq!(expiry_secs(Duration::from_millis(1)), 1);
        assert_eq!(expiry_secs(Duration::ZERO), 1);
        assert_eq!(expiry_secs(Duration::from_millis(1500)), 2);
        assert_eq!(expiry_secs(Duration::from_secs(60)), 60);
        assert_eq!(expiry_secs(Duration::MAX), MAX_TTL.as_secs());
    }
}
