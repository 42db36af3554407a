use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::adaptive::{AccessTracker, AdaptiveTtlPolicy};
use super::backend::{Capability, RemoteBackend};
use super::tags::TagIndex;
use crate::core::store::{RefreshFn, RevalidationHandle};
use crate::core::types::deadline;
use crate::core::{
    CacheError, CacheStore, CacheValue, ClearOptions, EntryState, MAX_TTL, Result, SetOptions,
    StoreConfig, StoreStats,
};
use crate::maintenance::MaintenanceHandle;
use crate::metrics::{CacheEvent, CacheObserver, EventBus, Operation, Outcome};

/// Backing store of a level
pub enum LevelHandle<V> {
    Local(CacheStore<String, V>),
    Remote(Arc<dyn RemoteBackend<V>>),
}

/// One backend in the priority-ordered chain
pub struct CacheLevel<V> {
    pub priority: u32,
    handle: LevelHandle<V>,
}

impl<V: CacheValue> CacheLevel<V> {
    pub fn local(priority: u32, store: CacheStore<String, V>) -> Self {
        Self {
            priority,
            handle: LevelHandle::Local(store),
        }
    }

    pub fn remote(priority: u32, backend: Arc<dyn RemoteBackend<V>>) -> Self {
        Self {
            priority,
            handle: LevelHandle::Remote(backend),
        }
    }

    pub fn capability(&self) -> Capability {
        match self.handle {
            LevelHandle::Local(_) => Capability::Local,
            LevelHandle::Remote(_) => Capability::Remote,
        }
    }

    pub fn handle(&self) -> &LevelHandle<V> {
        &self.handle
    }

    pub fn as_local(&self) -> Option<&CacheStore<String, V>> {
        match &self.handle {
            LevelHandle::Local(store) => Some(store),
            LevelHandle::Remote(_) => None,
        }
    }
}

/// Manager-wide settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Label used in logs (segment name)
    pub name: String,
    /// Base TTL for remote writes
    pub default_ttl: Duration,
    /// Version stamped on writes without an explicit version
    pub version: Option<String>,
    pub adaptive_ttl: Option<AdaptiveTtlPolicy>,
    /// Write lower-level hits back into higher-priority levels
    pub promote: bool,
    /// Upper bound on keys tracked for adaptive TTL
    pub max_tracked_keys: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_ttl: Duration::from_secs(300),
            version: None,
            adaptive_ttl: None,
            promote: true,
            max_tracked_keys: 100_000,
        }
    }
}

enum PendingLevel<V> {
    Local { priority: u32, config: StoreConfig },
    Prebuilt(CacheLevel<V>),
}

/// Builder wiring levels to the manager's event bus
pub struct ManagerBuilder<V> {
    config: ManagerConfig,
    events: EventBus,
    levels: Vec<PendingLevel<V>>,
}

impl<V: CacheValue> ManagerBuilder<V> {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            levels: Vec::new(),
        }
    }

    /// Add an in-process store created from `config`
    pub fn local(mut self, priority: u32, config: StoreConfig) -> Self {
        self.levels.push(PendingLevel::Local { priority, config });
        self
    }

    pub fn remote(mut self, priority: u32, backend: Arc<dyn RemoteBackend<V>>) -> Self {
        self.levels
            .push(PendingLevel::Prebuilt(CacheLevel::remote(priority, backend)));
        self
    }

    /// Add an existing level (e.g. a store shared with other code)
    pub fn level(mut self, level: CacheLevel<V>) -> Self {
        self.levels.push(PendingLevel::Prebuilt(level));
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<CacheManager<V>> {
        let mut levels = Vec::with_capacity(self.levels.len());
        for pending in self.levels {
            levels.push(match pending {
                PendingLevel::Local { priority, config } => CacheLevel::local(
                    priority,
                    CacheStore::with_events(config, self.events.clone())?,
                ),
                PendingLevel::Prebuilt(level) => level,
            });
        }
        CacheManager::new(self.config, levels, self.events)
    }
}

struct ManagerInner<V> {
    config: ManagerConfig,
    /// Sorted by descending priority, local before remote on ties
    levels: Vec<CacheLevel<V>>,
    tags: Mutex<TagIndex>,
    versions: Mutex<TagIndex>,
    /// When the remote copy written by this manager expires, per key
    remote_expiry: Mutex<HashMap<String, Instant>>,
    access: AccessTracker,
    events: EventBus,
}

/// Priority-ordered chain of cache levels behaving as one logical cache
pub struct CacheManager<V> {
    inner: Arc<ManagerInner<V>>,
}

impl<V> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> CacheManager<V> {
    pub fn builder(config: ManagerConfig) -> ManagerBuilder<V> {
        ManagerBuilder::new(config)
    }

    pub fn new(
        config: ManagerConfig,
        mut levels: Vec<CacheLevel<V>>,
        events: EventBus,
    ) -> Result<Self> {
        if levels.is_empty() {
            return Err(CacheError::InvalidConfig(format!(
                "cache manager '{}' needs at least one level",
                config.name
            )));
        }
        if config.default_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(format!(
                "cache manager '{}' default_ttl must be > 0",
                config.name
            )));
        }

        levels.sort_by_key(|level| {
            (
                std::cmp::Reverse(level.priority),
                level.capability() == Capability::Remote,
            )
        });

        info!(
            manager = %config.name,
            levels = levels.len(),
            remote = levels.iter().any(|l| l.capability() == Capability::Remote),
            adaptive_ttl = config.adaptive_ttl.is_some(),
            "Initializing cache manager"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                access: AccessTracker::new(config.max_tracked_keys),
                config,
                levels,
                tags: Mutex::new(TagIndex::new()),
                versions: Mutex::new(TagIndex::new()),
                remote_expiry: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn levels(&self) -> &[CacheLevel<V>] {
        &self.inner.levels
    }

    pub fn has_remote(&self) -> bool {
        self.inner
            .levels
            .iter()
            .any(|l| l.capability() == Capability::Remote)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a metric observer
    pub fn subscribe(&self, observer: Arc<dyn CacheObserver>) {
        self.inner.events.subscribe(observer);
    }

    /// Probe levels in priority order; remote errors count as misses
    pub async fn get(&self, key: &str) -> Option<V> {
        self.probe(key, None).await
    }

    /// Like `get`, refreshing a stale local entry in the background
    ///
    /// The refreshed value lands in the local level that served the stale
    /// read and, once accepted there, is forwarded to every remote level.
    pub async fn get_with_refresh<F, Fut>(&self, key: &str, refresh: F) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let refresh: RefreshFn<V> = Box::new(move || refresh().boxed());
        self.probe(key, Some(refresh)).await
    }

    /// Read-through: on a full miss run `compute`, store and return its result
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
        options: SetOptions,
    ) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), options).await;
        Ok(value)
    }

    async fn probe(&self, key: &str, mut refresh: Option<RefreshFn<V>>) -> Option<V> {
        let started = Instant::now();
        self.inner.access.record(key);
        let owned_key = key.to_string();

        for (index, level) in self.inner.levels.iter().enumerate() {
            let found = match &level.handle {
                LevelHandle::Local(store) => {
                    // Only the first local level gets the refresh callback;
                    // the read that starts it also forwards the result
                    store.lookup(&owned_key, refresh.take()).map(|found| {
                        if let Some(pending) = found.started {
                            self.forward_refresh(pending, key);
                        }
                        match found.state {
                            EntryState::Fresh => (found.value, Outcome::Hit),
                            _ => (found.value, Outcome::Stale),
                        }
                    })
                }
                LevelHandle::Remote(backend) => match backend.get(key).await {
                    Ok(value) => value.map(|v| (v, Outcome::Hit)),
                    Err(err) => {
                        warn!(
                            manager = %self.name(),
                            backend = %backend.name(),
                            key = %key,
                            error = %err,
                            "Remote level GET failed, treating as miss"
                        );
                        self.emit(
                            CacheEvent::new(Operation::Get, key, Outcome::Error, started.elapsed())
                                .with_level(Capability::Remote)
                                .with_error(&err),
                        );
                        None
                    }
                },
            };

            if let Some((value, outcome)) = found {
                if index > 0 && self.inner.config.promote {
                    self.promote(key, &value, index);
                }
                debug!(manager = %self.name(), key = %key, level = index, "cache {}", outcome);
                self.emit(
                    CacheEvent::new(Operation::Get, key, outcome, started.elapsed())
                        .with_level(level.capability()),
                );
                return Some(value);
            }
        }

        debug!(manager = %self.name(), key = %key, "cache miss");
        self.emit(CacheEvent::new(
            Operation::Get,
            key,
            Outcome::Miss,
            started.elapsed(),
        ));
        None
    }

    /// Copy the outcome of a local refresh to the remote levels
    fn forward_refresh(&self, pending: RevalidationHandle<V>, key: &str) {
        if !self.has_remote() {
            return;
        }
        let manager = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Some(value) = pending.await {
                manager.write_remote(&key, &value, None);
            }
        });
    }

    /// Write a value found at `found_at` into every higher-priority level
    fn promote(&self, key: &str, value: &V, found_at: usize) {
        for level in &self.inner.levels[..found_at] {
            match &level.handle {
                LevelHandle::Local(store) => {
                    let ttl = self.calculate_adaptive_ttl(key, store.config().ttl);
                    store.set(
                        key.to_string(),
                        value.clone(),
                        SetOptions {
                            ttl: Some(ttl),
                            version: self.inner.config.version.clone(),
                            ..Default::default()
                        },
                    );
                }
                LevelHandle::Remote(backend) => {
                    let ttl = self.calculate_adaptive_ttl(key, self.inner.config.default_ttl);
                    self.note_remote_write(key, ttl);
                    self.spawn_remote_set(Arc::clone(backend), key, value.clone(), ttl);
                }
            }
            self.emit(
                CacheEvent::new(Operation::Promote, key, Outcome::Ok, Duration::ZERO)
                    .with_level(level.capability()),
            );
        }
    }

    /// Write to every level; remote writes are fire-and-forget
    pub async fn set(&self, key: &str, value: V, options: SetOptions) {
        let started = Instant::now();
        let mut options = options;
        if options.version.is_none() {
            options.version = self.inner.config.version.clone();
        }

        self.inner.tags.lock().assign(key, &options.tags);
        self.inner
            .versions
            .lock()
            .assign(key, options.version.iter());

        for level in &self.inner.levels {
            if let LevelHandle::Local(store) = &level.handle {
                let mut level_options = options.clone();
                if level_options.ttl.is_none() {
                    level_options.ttl = Some(self.calculate_adaptive_ttl(key, store.config().ttl));
                }
                store.set(key.to_string(), value.clone(), level_options);
            }
        }
        self.write_remote(key, &value, options.ttl);

        debug!(manager = %self.name(), key = %key, tags = ?options.tags, "cache set");
        self.emit(CacheEvent::new(
            Operation::Set,
            key,
            Outcome::Ok,
            started.elapsed(),
        ));
    }

    fn write_remote(&self, key: &str, value: &V, ttl: Option<Duration>) {
        if !self.has_remote() {
            return;
        }
        let ttl = ttl
            .unwrap_or_else(|| self.calculate_adaptive_ttl(key, self.inner.config.default_ttl))
            .min(MAX_TTL);
        self.note_remote_write(key, ttl);
        for level in &self.inner.levels {
            if let LevelHandle::Remote(backend) = &level.handle {
                self.spawn_remote_set(Arc::clone(backend), key, value.clone(), ttl);
            }
        }
    }

    /// Remember when the remote copy of `key` expires, for index pruning
    fn note_remote_write(&self, key: &str, ttl: Duration) {
        self.inner
            .remote_expiry
            .lock()
            .insert(key.to_string(), deadline(Instant::now(), ttl));
    }

    fn spawn_remote_set(
        &self,
        backend: Arc<dyn RemoteBackend<V>>,
        key: &str,
        value: V,
        ttl: Duration,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No tokio runtime, skipping remote write");
            return;
        };

        let events = self.inner.events.clone();
        let manager = self.name().to_string();
        let key = key.to_string();
        runtime.spawn(async move {
            let started = Instant::now();
            if let Err(err) = backend.set(&key, value, ttl).await {
                warn!(
                    manager = %manager,
                    backend = %backend.name(),
                    key = %key,
                    error = %err,
                    "Remote level SET failed"
                );
                events.emit(
                    CacheEvent::new(Operation::Set, key, Outcome::Error, started.elapsed())
                        .with_level(Capability::Remote)
                        .with_error(err),
                );
            }
        });
    }

    /// Delete from every level; returns true if any level held the key
    pub async fn delete(&self, key: &str) -> bool {
        let started = Instant::now();
        self.inner.tags.lock().remove_key(key);
        self.inner.versions.lock().remove_key(key);
        self.inner.remote_expiry.lock().remove(key);
        self.inner.access.forget(key);

        let (removed, failures) = self.delete_everywhere(key).await;
        for failure in &failures {
            warn!(
                manager = %self.name(),
                key = %key,
                error = %failure,
                "Remote level DELETE failed"
            );
        }

        let outcome = if failures.is_empty() {
            Outcome::Ok
        } else {
            Outcome::Error
        };
        let mut event = CacheEvent::new(Operation::Delete, key, outcome, started.elapsed());
        if let Some(first) = failures.first() {
            event = event.with_error(first);
        }
        self.emit(event);
        removed
    }

    /// Remove `key` from all levels, collecting remote failures
    async fn delete_everywhere(&self, key: &str) -> (bool, Vec<String>) {
        let owned_key = key.to_string();
        let mut removed = false;
        let mut failures = Vec::new();

        for level in &self.inner.levels {
            match &level.handle {
                LevelHandle::Local(store) => removed |= store.delete(&owned_key),
                LevelHandle::Remote(backend) => match backend.delete(key).await {
                    Ok(hit) => removed |= hit,
                    Err(err) => failures.push(format!("{}: {}", backend.name(), err)),
                },
            }
        }
        (removed, failures)
    }

    /// Delete every key tagged with `tag` from every level
    ///
    /// Returns the number of keys invalidated. Remote delete failures are
    /// surfaced as `CacheError::Invalidation` after every delete was attempted.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<usize> {
        let keys = self.inner.tags.lock().take(tag);
        self.invalidate_keys(format!("tag '{tag}'"), tag, keys).await
    }

    /// Delete every key stamped with `version` from every level
    pub async fn invalidate_version(&self, version: &str) -> Result<usize> {
        let mut keys: HashSet<String> =
            self.inner.versions.lock().take(version).into_iter().collect();
        for level in &self.inner.levels {
            if let LevelHandle::Local(store) = &level.handle {
                keys.extend(store.invalidate_version(version));
            }
        }
        let keys = keys.into_iter().collect();
        self.invalidate_keys(format!("version '{version}'"), version, keys)
            .await
    }

    async fn invalidate_keys(
        &self,
        target: String,
        label: &str,
        keys: Vec<String>,
    ) -> Result<usize> {
        let started = Instant::now();
        let mut failures = Vec::new();

        for key in &keys {
            self.inner.tags.lock().remove_key(key);
            self.inner.versions.lock().remove_key(key);
            self.inner.remote_expiry.lock().remove(key);
            let (_, key_failures) = self.delete_everywhere(key).await;
            failures.extend(key_failures.into_iter().map(|f| format!("{key}: {f}")));
        }

        info!(
            manager = %self.name(),
            target = %target,
            keys = keys.len(),
            failures = failures.len(),
            "Cache invalidation"
        );

        if failures.is_empty() {
            self.emit(CacheEvent::new(
                Operation::Invalidate,
                label,
                Outcome::Ok,
                started.elapsed(),
            ));
            Ok(keys.len())
        } else {
            self.emit(
                CacheEvent::new(Operation::Invalidate, label, Outcome::Error, started.elapsed())
                    .with_error(failures.join("; ")),
            );
            Err(CacheError::Invalidation { target, failures })
        }
    }

    /// Clear every level and the indexes; remote failures are logged
    pub async fn clear(&self) {
        let started = Instant::now();
        self.inner.tags.lock().clear();
        self.inner.versions.lock().clear();
        self.inner.remote_expiry.lock().clear();
        self.inner.access.clear();

        let mut outcome = Outcome::Ok;
        for level in &self.inner.levels {
            match &level.handle {
                LevelHandle::Local(store) => store.clear(ClearOptions::default()),
                LevelHandle::Remote(backend) => {
                    if let Err(err) = backend.clear().await {
                        warn!(
                            manager = %self.name(),
                            backend = %backend.name(),
                            error = %err,
                            "Remote level CLEAR failed"
                        );
                        outcome = Outcome::Error;
                    }
                }
            }
        }

        info!(manager = %self.name(), "Cache cleared");
        self.emit(CacheEvent::new(
            Operation::Clear,
            "*",
            outcome,
            started.elapsed(),
        ));
    }

    /// TTL for `key` scaled by its recent access frequency
    ///
    /// Returns `base` unchanged when no adaptive policy is configured.
    pub fn calculate_adaptive_ttl(&self, key: &str, base: Duration) -> Duration {
        match &self.inner.config.adaptive_ttl {
            Some(policy) => policy.compute(base, self.inner.access.count(key)),
            None => base,
        }
    }

    /// Recent access count used by the adaptive TTL
    pub fn access_count(&self, key: &str) -> u64 {
        self.inner.access.count(key)
    }

    pub fn tags_for(&self, key: &str) -> Vec<String> {
        self.inner.tags.lock().labels_for(key)
    }

    /// Number of keys held by the tag index
    pub fn tagged_keys(&self) -> usize {
        self.inner.tags.lock().key_count()
    }

    /// Number of keys held by the version index
    pub fn versioned_keys(&self) -> usize {
        self.inner.versions.lock().key_count()
    }

    /// Statistics of every local level, in priority order
    pub fn stats(&self) -> Vec<StoreStats> {
        self.inner
            .levels
            .iter()
            .filter_map(|l| l.as_local().map(|store| store.stats()))
            .collect()
    }

    /// One maintenance pass: purge expired entries, decay access counts
    pub fn cleanup(&self) -> usize {
        let purged: usize = self
            .inner
            .levels
            .iter()
            .filter_map(|l| l.as_local())
            .map(|store| store.cleanup())
            .sum();
        self.inner.access.decay();

        // Index entries live as long as a local copy or an unexpired remote copy
        let now = Instant::now();
        let mut remote_expiry = self.inner.remote_expiry.lock();
        remote_expiry.retain(|_, expires_at| now < *expires_at);
        let remote = &*remote_expiry;
        let owned = |key: &str| {
            remote.contains_key(key)
                || self
                    .inner
                    .levels
                    .iter()
                    .filter_map(|l| l.as_local())
                    .any(|store| store.has(&key.to_string()))
        };
        self.inner.tags.lock().retain_keys(owned);
        self.inner.versions.lock().retain_keys(owned);
        drop(remote_expiry);

        if purged > 0 {
            debug!(manager = %self.name(), purged, "Cache maintenance pass");
        }
        purged
    }

    /// Run `cleanup` every `interval` until the handle is shut down
    pub fn start_maintenance(&self, interval: Duration) -> MaintenanceHandle {
        let weak: Weak<ManagerInner<V>> = Arc::downgrade(&self.inner);
        MaintenanceHandle::spawn(
            format!("{}-maintenance", self.name()),
            interval,
            move || match weak.upgrade() {
                Some(inner) => {
                    CacheManager { inner }.cleanup();
                    true
                }
                None => false,
            },
        )
    }

    fn emit(&self, event: CacheEvent) {
        self.inner.events.emit(event);
    }
}
