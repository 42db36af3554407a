use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{CacheError, Result};
use super::types::{
    CacheEntry, CacheKey, ClearOptions, EntryInfo, EntryState, EvictionPolicy, MAX_TTL,
    SetOptions, StoreConfig, StoreStats, Weigher, deadline,
};
use crate::maintenance::MaintenanceHandle;
use crate::metrics::{CacheEvent, EventBus, Operation, Outcome};

/// Bounds every cached value has to satisfy
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Awaitable handle to an in-flight refresh
///
/// Resolves to the new value on success, `None` when the refresh failed or
/// its result was discarded because the key was invalidated meanwhile.
pub type RevalidationHandle<V> = Shared<BoxFuture<'static, Option<V>>>;

/// Type-erased refresh callback
pub(crate) type RefreshFn<V> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<V>> + Send>;

/// Outcome of a single read
pub(crate) struct Lookup<V> {
    pub value: V,
    /// `Fresh`, or `Stale` for anything served from the SWR window
    pub state: EntryState,
    /// Handle of the refresh this read started, if it started one
    pub started: Option<RevalidationHandle<V>>,
}

/// In-flight refresh for one key
struct Pending<V> {
    id: u64,
    handle: RevalidationHandle<V>,
}

/// Entry table, LRU index and pending-refresh table, guarded by one lock
struct StoreState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// access sequence -> key, oldest first
    lru: BTreeMap<u64, K>,
    pending: HashMap<K, Pending<V>>,
    next_seq: u64,
    next_revalidation_id: u64,
    total_bytes: usize,
    stats: StoreStats,
}

impl<K: CacheKey, V: CacheValue> StoreState<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            pending: HashMap::new(),
            next_seq: 0,
            next_revalidation_id: 0,
            total_bytes: 0,
            stats: StoreStats::default(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Mark as most recently used and return a copy of the value
    fn touch(&mut self, key: &K, now: Instant) -> Option<V> {
        let seq = self.next_seq();
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&entry.access_seq);
        entry.access_seq = seq;
        entry.last_accessed = now;
        self.lru.insert(seq, key.clone());
        Some(entry.value.clone())
    }

    /// Remove the entry but keep any in-flight refresh
    fn remove_entry(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.access_seq);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Remove the entry and drop its in-flight refresh
    fn discard(&mut self, key: &K) -> Option<CacheEntry<V>> {
        self.pending.remove(key);
        self.remove_entry(key)
    }

    fn pop_lru(&mut self) -> Option<K> {
        let (_, key) = self.lru.pop_first()?;
        self.pending.remove(&key);
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        }
        Some(key)
    }
}

struct StoreInner<K, V> {
    config: StoreConfig,
    weigher: Option<Weigher<K, V>>,
    state: Mutex<StoreState<K, V>>,
    events: EventBus,
}

/// Bounded in-process cache with TTL, stale-while-revalidate and LRU eviction
///
/// Cloning is cheap and yields a handle to the same table.
pub struct CacheStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K, V> Clone for CacheStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> {
    /// Create a new store; rejects non-positive ttl/max_size
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::build(config, EventBus::new(), None)
    }

    /// Create a store that reports evictions, expirations and refreshes to `events`
    pub fn with_events(config: StoreConfig, events: EventBus) -> Result<Self> {
        Self::build(config, events, None)
    }

    /// Create a store with a custom entry weigher for the byte budget
    pub fn with_weigher(
        config: StoreConfig,
        events: EventBus,
        weigher: Weigher<K, V>,
    ) -> Result<Self> {
        Self::build(config, events, Some(weigher))
    }

    fn build(config: StoreConfig, events: EventBus, weigher: Option<Weigher<K, V>>) -> Result<Self> {
        config.validate()?;
        debug!(
            "Initializing cache store with ttl={:?}, max_size={}, swr={:?}, eviction={:?}",
            config.ttl,
            config.max_size,
            config.stale_while_revalidate,
            config.eviction_policy()
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                weigher,
                state: Mutex::new(StoreState::new()),
                events,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Get a value; stale values inside the SWR window are still returned
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key, None).map(|found| found.value)
    }

    /// Get a value, refreshing it in the background when it is stale
    ///
    /// Returns immediately with the current value. At most one refresh per
    /// key runs at a time; its result replaces the entry once it resolves.
    pub fn get_with_refresh<F, Fut>(&self, key: &K, refresh: F) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.lookup(key, Some(Box::new(move || refresh().boxed())))
            .map(|found| found.value)
    }

    /// Read that also reports freshness and whether it started a refresh
    pub(crate) fn lookup(&self, key: &K, refresh: Option<RefreshFn<V>>) -> Option<Lookup<V>> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let Some(entry_state) = state.entries.get(key).map(|e| e.state_at(now)) else {
            state.stats.misses += 1;
            debug!("Cache MISS for key: {}", key);
            return None;
        };

        match entry_state {
            EntryState::Fresh => {
                state.stats.hits += 1;
                debug!("Cache HIT for key: {}", key);
                state.touch(key, now).map(|value| Lookup {
                    value,
                    state: EntryState::Fresh,
                    started: None,
                })
            }
            EntryState::Stale | EntryState::Revalidating => {
                state.stats.stale_hits += 1;
                debug!("Cache STALE HIT for key: {}", key);
                let value = state.touch(key, now)?;
                let started = match refresh {
                    Some(refresh) if !state.pending.contains_key(key) => {
                        self.start_revalidation(&mut state, key, refresh)
                    }
                    _ => None,
                };
                Some(Lookup {
                    value,
                    state: EntryState::Stale,
                    started,
                })
            }
            EntryState::Expired => {
                state.discard(key);
                state.stats.expirations += 1;
                state.stats.misses += 1;
                drop(state);

                debug!("Cache EXPIRED for key: {}", key);
                self.emit(Operation::Expire, key, Outcome::Ok);
                None
            }
        }
    }

    fn start_revalidation(
        &self,
        state: &mut StoreState<K, V>,
        key: &K,
        refresh: RefreshFn<V>,
    ) -> Option<RevalidationHandle<V>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, skipping revalidation of key: {}", key);
            return None;
        };

        let entry = state.entries.get_mut(key)?;
        entry.is_revalidating = true;
        let options = SetOptions {
            ttl: Some(entry.ttl),
            stale_while_revalidate: Some(entry.stale_while_revalidate),
            etag: entry.etag.clone(),
            last_modified: entry.last_modified,
            version: entry.version.clone(),
            ..Default::default()
        };

        let id = state.next_revalidation_id;
        state.next_revalidation_id += 1;
        state.stats.revalidations += 1;
        debug!("Cache REVALIDATE start for key: {}", key);

        let store = self.clone();
        let task_key = key.clone();
        let task = runtime.spawn(async move {
            let started = Instant::now();
            let result = AssertUnwindSafe(async move { refresh().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("refresh callback panicked")));
            store.finish_revalidation(task_key, id, result, options, started.elapsed())
        });

        let handle = task.map(|joined| joined.ok().flatten()).boxed().shared();
        state.pending.insert(
            key.clone(),
            Pending {
                id,
                handle: handle.clone(),
            },
        );
        Some(handle)
    }

    fn finish_revalidation(
        &self,
        key: K,
        id: u64,
        result: anyhow::Result<V>,
        options: SetOptions,
        latency: Duration,
    ) -> Option<V> {
        let mut state = self.inner.state.lock();
        let owns_slot = state.pending.get(&key).is_some_and(|p| p.id == id);
        if owns_slot {
            state.pending.remove(&key);
        }

        match result {
            Ok(value) if owns_slot => {
                let evicted = self.insert_locked(&mut state, key.clone(), value.clone(), &options);
                drop(state);

                debug!("Cache REVALIDATE done for key: {}", key);
                self.emit_evictions(evicted);
                self.inner.events.emit(CacheEvent::new(
                    Operation::Revalidate,
                    key.to_string(),
                    Outcome::Ok,
                    latency,
                ));
                Some(value)
            }
            Ok(_) => {
                drop(state);
                debug!("Discarding refresh result for invalidated key: {}", key);
                None
            }
            Err(err) => {
                if owns_slot {
                    if let Some(entry) = state.entries.get_mut(&key) {
                        entry.is_revalidating = false;
                    }
                }
                state.stats.revalidation_failures += 1;
                drop(state);

                let err = CacheError::Revalidation(format!("key {key}: {err:#}"));
                warn!("{}", err);
                self.inner.events.emit(
                    CacheEvent::new(
                        Operation::Revalidate,
                        key.to_string(),
                        Outcome::Error,
                        latency,
                    )
                    .with_error(&err),
                );
                None
            }
        }
    }

    /// Insert or overwrite a value, evicting LRU entries first when full
    ///
    /// An in-flight refresh of `key` is discarded so it cannot replace
    /// the newer value when it lands.
    pub fn set(&self, key: K, value: V, options: SetOptions) {
        let mut state = self.inner.state.lock();
        state.pending.remove(&key);
        let evicted = self.insert_locked(&mut state, key, value, &options);
        drop(state);
        self.emit_evictions(evicted);
    }

    fn insert_locked(
        &self,
        state: &mut StoreState<K, V>,
        key: K,
        value: V,
        options: &SetOptions,
    ) -> Vec<K> {
        let config = &self.inner.config;
        let now = Instant::now();
        let ttl = options
            .ttl
            .filter(|t| !t.is_zero())
            .unwrap_or(config.ttl)
            .min(MAX_TTL);
        let stale_while_revalidate = options
            .stale_while_revalidate
            .unwrap_or(config.stale_while_revalidate)
            .min(MAX_TTL);
        let size = options.size.unwrap_or_else(|| self.weigh(&key, &value));

        state.remove_entry(&key);

        let max_bytes = match config.eviction_policy() {
            EvictionPolicy::LruWithByteBudget { max_bytes } => {
                if size > max_bytes {
                    state.pending.remove(&key);
                    warn!(
                        "Entry {} ({} bytes) exceeds the byte budget of {} bytes, not cached",
                        key, size, max_bytes
                    );
                    return Vec::new();
                }
                Some(max_bytes)
            }
            EvictionPolicy::Lru => None,
        };

        let mut evicted = Vec::new();
        while state.entries.len() >= config.max_size
            || max_bytes.is_some_and(|max| state.total_bytes + size > max)
        {
            match state.pop_lru() {
                Some(evict_key) => {
                    debug!("Cache EVICT: {}", evict_key);
                    state.stats.evictions += 1;
                    evicted.push(evict_key);
                }
                None => break,
            }
        }

        let seq = state.next_seq();
        let entry = CacheEntry {
            value,
            expires_at: deadline(now, ttl),
            last_accessed: now,
            access_seq: seq,
            ttl,
            stale_while_revalidate,
            is_revalidating: false,
            etag: options.etag.clone(),
            last_modified: options.last_modified,
            version: options.version.clone().or_else(|| config.version.clone()),
            size,
        };

        debug!("Cache PUT: {} ({} bytes, ttl={:?})", key, size, ttl);
        state.lru.insert(seq, key.clone());
        state.entries.insert(key, entry);
        state.total_bytes += size;
        state.stats.sets += 1;

        evicted
    }

    fn weigh(&self, key: &K, value: &V) -> usize {
        match &self.inner.weigher {
            Some(weigher) => weigher(key, value),
            None => std::mem::size_of::<K>() + std::mem::size_of::<V>(),
        }
    }

    /// Delete a key; returns true if an entry was removed
    pub fn delete(&self, key: &K) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.discard(key).is_some();
        if removed {
            state.stats.deletes += 1;
            debug!("Cache DELETE: {}", key);
        }
        removed
    }

    /// Whether a servable (fresh or stale) entry exists
    pub fn has(&self, key: &K) -> bool {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .is_some_and(|e| e.state_at(now) != EntryState::Expired)
    }

    /// Snapshot of the keys currently held
    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().entries.keys().cloned().collect()
    }

    /// Number of entries currently held
    pub fn size(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Metadata snapshot for conditional revalidation
    pub fn entry_info(&self, key: &K) -> Option<EntryInfo> {
        let now = Instant::now();
        self.inner.state.lock().entries.get(key).map(|e| e.info(now))
    }

    /// Handle to the in-flight refresh of `key`, if any
    pub fn pending_revalidation(&self, key: &K) -> Option<RevalidationHandle<V>> {
        self.inner
            .state
            .lock()
            .pending
            .get(key)
            .map(|p| p.handle.clone())
    }

    pub fn is_revalidating(&self, key: &K) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    /// Remove every entry matching `predicate`; returns the removed keys
    pub fn invalidate_matching<P>(&self, predicate: P) -> Vec<K>
    where
        P: Fn(&K, &V) -> bool,
    {
        let mut state = self.inner.state.lock();
        let matched: Vec<K> = state
            .entries
            .iter()
            .filter(|(k, e)| predicate(k, &e.value))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &matched {
            state.discard(key);
        }
        state.stats.deletes += matched.len() as u64;
        drop(state);

        if !matched.is_empty() {
            debug!("Cache INVALIDATE {} entries", matched.len());
        }
        for key in &matched {
            self.emit(Operation::Invalidate, key, Outcome::Ok);
        }
        matched
    }

    /// Remove every entry stamped with `version`; returns the removed keys
    pub fn invalidate_version(&self, version: &str) -> Vec<K> {
        let mut state = self.inner.state.lock();
        let matched: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, e)| e.version.as_deref() == Some(version))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &matched {
            state.discard(key);
        }
        state.stats.deletes += matched.len() as u64;
        drop(state);

        debug!("Cache INVALIDATE version={} ({} entries)", version, matched.len());
        for key in &matched {
            self.emit(Operation::Invalidate, key, Outcome::Ok);
        }
        matched
    }

    /// Remove every entry
    pub fn clear(&self, options: ClearOptions) {
        let mut state = self.inner.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.lru.clear();
        state.total_bytes = 0;
        if !options.preserve_revalidation_state {
            state.pending.clear();
        }
        debug!("Cache CLEAR ({} entries)", count);
    }

    /// Purge entries whose SWR window has elapsed; returns the number purged
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, e)| e.state_at(now) == EntryState::Expired)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.discard(key);
        }
        state.stats.expirations += expired.len() as u64;
        drop(state);

        if !expired.is_empty() {
            debug!("Cleaning up {} expired keys", expired.len());
        }
        for key in &expired {
            self.emit(Operation::Expire, key, Outcome::Ok);
        }
        expired.len()
    }

    /// Get statistics
    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.entries = state.entries.len();
        stats.total_bytes = state.total_bytes;
        stats
    }

    /// Start the periodic cleanup sweep
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    pub fn start_cleanup(&self, interval: Duration) -> MaintenanceHandle {
        info!("Starting cache cleanup task (interval={:?})", interval);
        let weak: Weak<StoreInner<K, V>> = Arc::downgrade(&self.inner);
        MaintenanceHandle::spawn("store-cleanup", interval, move || match weak.upgrade() {
            Some(inner) => {
                CacheStore { inner }.cleanup();
                true
            }
            None => false,
        })
    }

    fn emit(&self, operation: Operation, key: &K, outcome: Outcome) {
        self.inner.events.emit(CacheEvent::new(
            operation,
            key.to_string(),
            outcome,
            Duration::ZERO,
        ));
    }

    fn emit_evictions(&self, evicted: Vec<K>) {
        for key in &evicted {
            self.emit(Operation::Evict, key, Outcome::Ok);
        }
    }
}
