//! Remote cache level contract and the in-process implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::types::deadline;
use crate::core::{CacheError, CacheValue, Result};

/// Where a cache level lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// In-process store, microsecond latency
    Local,
    /// Network backend, shared across processes
    Remote,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// The only interface the manager requires from an external store
///
/// Any error returned here is treated as a miss/no-op by the manager.
#[async_trait]
pub trait RemoteBackend<V>: Send + Sync {
    /// Backend name for logs and events
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<V>>;

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove everything this backend handle owns
    async fn clear(&self) -> Result<()>;
}

/// In-process remote level
///
/// Useful for single-host deployments and for exercising the remote code
/// paths in tests; failures can be injected with [`MemoryBackend::set_failing`].
pub struct MemoryBackend<V> {
    name: String,
    data: Mutex<HashMap<String, (V, Instant)>>,
    failing: AtomicBool,
    gets: AtomicU64,
    sets: AtomicU64,
}

impl<V: CacheValue> MemoryBackend<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Make every subsequent call fail with a backend error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `get` calls served (including failed ones)
    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `set` calls received (including failed ones)
    pub fn set_calls(&self) -> u64 {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.data
            .lock()
            .get(key)
            .is_some_and(|(_, expires_at)| now < *expires_at)
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write directly, bypassing failure injection and counters
    pub fn seed(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.data
            .lock()
            .insert(key.into(), (value, deadline(Instant::now(), ttl)));
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::backend(&self.name, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<V: CacheValue> RemoteBackend<V> for MemoryBackend<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let now = Instant::now();
        let mut data = self.data.lock();
        match data.get(key) {
            Some((value, expires_at)) if now < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.seed(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.data.lock().remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.data.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new("mem");

        backend.set("k", 1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(1));
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.get_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_expiry() {
        let backend = MemoryBackend::new("mem");
        backend.set("k", 1, Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_caps_huge_ttl() {
        let backend = MemoryBackend::new("mem");
        backend.set("k", 1, Duration::MAX).await.unwrap();
        assert!(backend.contains("k"));
    }

    #[tokio::test]
    async fn test_memory_backend_injected_failure() {
        let backend = MemoryBackend::<i32>::new("mem");
        backend.set_failing(true);

        let err = backend.get("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.is_fail_open());
        assert!(backend.clear().await.is_err());

        backend.set_failing(false);
        assert!(backend.clear().await.is_ok());
    }
}
