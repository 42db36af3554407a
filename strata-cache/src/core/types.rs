use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::error::{CacheError, Result};

/// Bounds every cache key has to satisfy
pub trait CacheKey: Hash + Eq + Clone + Display + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Hash + Eq + Clone + Display + Send + Sync + 'static {}

/// Computes the byte weight of an entry for the byte-budget policy
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> usize + Send + Sync>;

/// Longest TTL or stale window an entry can carry (100 years)
///
/// Longer per-call values are capped; configured values beyond it are rejected.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `base * factor`, or `None` when the product is negative, not finite or
/// longer than [`MAX_TTL`]
pub(crate) fn scale_duration(base: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(base.as_secs_f64() * factor)
        .ok()
        .filter(|scaled| *scaled <= MAX_TTL)
}

/// `start + span` with `span` capped at [`MAX_TTL`]
pub(crate) fn deadline(start: Instant, span: Duration) -> Instant {
    // A capped span cannot overflow a monotonic clock
    start.checked_add(span.min(MAX_TTL)).unwrap_or(start)
}

/// Stored entry with expiry and revalidation metadata
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    /// Time of the last read or write
    pub last_accessed: Instant,
    /// Position in the LRU index, strictly increasing across the store
    pub access_seq: u64,
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
    pub is_revalidating: bool,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub size: usize,
}

impl<V> CacheEntry<V> {
    pub fn state_at(&self, now: Instant) -> EntryState {
        if now <= self.expires_at {
            EntryState::Fresh
        } else if now < deadline(self.expires_at, self.stale_while_revalidate) {
            if self.is_revalidating {
                EntryState::Revalidating
            } else {
                EntryState::Stale
            }
        } else {
            EntryState::Expired
        }
    }

    pub fn info(&self, now: Instant) -> EntryInfo {
        EntryInfo {
            state: self.state_at(now),
            expires_at: self.expires_at,
            last_accessed: self.last_accessed,
            stale_while_revalidate: self.stale_while_revalidate,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            version: self.version.clone(),
            size: self.size,
        }
    }
}

/// Lifecycle state of an entry as observed at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Fresh,
    Stale,
    Revalidating,
    /// Past the SWR window; purged on next access or sweep
    Expired,
}

/// Read-only snapshot of an entry's metadata
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub state: EntryState,
    pub expires_at: Instant,
    pub last_accessed: Instant,
    pub stale_while_revalidate: Duration,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub size: usize,
}

/// Per-call options for `set`
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub version: Option<String>,
    /// Tags for bulk invalidation (manager level only)
    pub tags: Vec<String>,
    /// Explicit byte weight, overrides the store's weigher
    pub size: Option<usize>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = Some(window);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Options for `clear`
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearOptions {
    /// Keep in-flight refreshes so their results land after the clear
    pub preserve_revalidation_state: bool,
}

/// Configuration for a single `CacheStore`
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Default freshness window, must be > 0
    pub ttl: Duration,
    /// Item-count ceiling, must be > 0
    pub max_size: usize,
    /// Window after expiry during which stale values are still served
    pub stale_while_revalidate: Duration,
    /// Version stamped on entries that don't carry their own
    pub version: Option<String>,
    /// Optional byte budget; enables size-aware eviction
    pub max_bytes: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_size: 10_000,
            stale_while_revalidate: Duration::from_secs(60),
            version: None,
            max_bytes: None,
        }
    }
}

impl StoreConfig {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            ..Default::default()
        }
    }

    pub fn with_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = window;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Reject values the store cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be > 0".to_string()));
        }
        if self.ttl > MAX_TTL || self.stale_while_revalidate > MAX_TTL {
            return Err(CacheError::InvalidConfig(format!(
                "ttl and stale_while_revalidate must not exceed {MAX_TTL:?}"
            )));
        }
        if self.max_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_size must be > 0".to_string(),
            ));
        }
        if self.max_bytes == Some(0) {
            return Err(CacheError::InvalidConfig(
                "max_bytes must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Eviction policy implied by the configuration
    pub fn eviction_policy(&self) -> EvictionPolicy {
        match self.max_bytes {
            Some(max_bytes) => EvictionPolicy::LruWithByteBudget { max_bytes },
            None => EvictionPolicy::Lru,
        }
    }
}

/// Eviction policy for memory management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least Recently Used, bounded by item count
    Lru,
    /// LRU-first until both item count and byte budget are satisfied
    LruWithByteBudget { max_bytes: usize },
}

/// Statistics for a single store
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    /// Number of live entries
    pub entries: usize,
    /// Sum of entry weights
    pub total_bytes: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
}

impl StoreStats {
    /// Calculate hit rate (stale hits count as hits)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
