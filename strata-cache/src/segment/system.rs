use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::profile::{SegmentConfig, resolve_segments};
use crate::cache::{CacheManager, RedisBackend, RemoteBackend};
use crate::config::{Environment, SystemConfig};
use crate::core::{CacheError, CacheValue, Result, SetOptions, StoreStats};
use crate::maintenance::MaintenanceHandle;
use crate::metrics::{BroadcastObserver, CacheEvent, CacheObserver, EventBus};

/// Priority of the in-process level of every segment
const LOCAL_PRIORITY: u32 = 100;
/// Priority of the remote level of every segment
const REMOTE_PRIORITY: u32 = 10;

/// Builds the remote level of a segment from its name
pub type RemoteFactory<V> = dyn Fn(&str) -> Arc<dyn RemoteBackend<V>> + Send + Sync;

struct Segment<V> {
    config: SegmentConfig,
    manager: CacheManager<V>,
}

/// Registry of segments, one `CacheManager` per data domain
///
/// Events of every segment are annotated with the segment name and the
/// environment, then forwarded to the system observers and to the
/// broadcast stream returned by [`CacheSystem::subscribe`].
pub struct CacheSystem<V = serde_json::Value> {
    config: SystemConfig,
    segments: BTreeMap<String, Segment<V>>,
    events: EventBus,
    sender: broadcast::Sender<CacheEvent>,
    maintenance: Mutex<Vec<MaintenanceHandle>>,
}

impl<V> CacheSystem<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Build the system, attaching Redis when the environment allows it
    ///
    /// A failed Redis connection degrades every segment to local-only.
    pub async fn new(config: SystemConfig) -> Result<Self> {
        config.validate()?;

        let redis = match (&config.remote_url, config.environment.allows_remote()) {
            (Some(url), true) => match RedisBackend::connect(url, &config.namespace).await {
                Ok(backend) => Some(backend),
                Err(err) => {
                    warn!(
                        error = %err,
                        environment = %config.environment,
                        "Remote cache level unavailable, running local-only"
                    );
                    None
                }
            },
            _ => None,
        };

        match redis {
            Some(redis) => {
                let factory = move |segment: &str| -> Arc<dyn RemoteBackend<V>> {
                    Arc::new(redis.scoped(segment))
                };
                Self::build(config, Some(&factory))
            }
            None => Self::build(config, None),
        }
    }
}

impl<V: CacheValue> CacheSystem<V> {
    /// Local-only system regardless of environment
    pub fn local(config: SystemConfig) -> Result<Self> {
        config.validate()?;
        Self::build(config, None)
    }

    /// System whose remote levels come from `factory`
    ///
    /// The factory is ignored in development, like a configured Redis URL.
    pub fn with_remote<F>(config: SystemConfig, factory: F) -> Result<Self>
    where
        F: Fn(&str) -> Arc<dyn RemoteBackend<V>> + Send + Sync + 'static,
    {
        config.validate()?;
        if config.environment.allows_remote() {
            Self::build(config, Some(&factory))
        } else {
            Self::build(config, None)
        }
    }

    fn build(config: SystemConfig, remote: Option<&RemoteFactory<V>>) -> Result<Self> {
        let (sender, _) = broadcast::channel(config.event_buffer);
        let events = EventBus::new();
        events.subscribe(Arc::new(BroadcastObserver::new(sender.clone())));

        let mut segments = BTreeMap::new();
        for (name, segment_config) in resolve_segments(&config)? {
            let manager_events = EventBus::new();
            manager_events.subscribe(relay(&name, config.environment, events.clone()));

            let mut builder = CacheManager::builder(segment_config.manager_config())
                .events(manager_events)
                .local(LOCAL_PRIORITY, segment_config.store.clone());
            if let Some(factory) = remote {
                builder = builder.remote(REMOTE_PRIORITY, factory(&name));
            }

            segments.insert(
                name,
                Segment {
                    manager: builder.build()?,
                    config: segment_config,
                },
            );
        }

        info!(
            namespace = %config.namespace,
            environment = %config.environment,
            segments = segments.len(),
            remote = remote.is_some(),
            "Cache system initialized"
        );

        Ok(Self {
            config,
            segments,
            events,
            sender,
            maintenance: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.config.environment
    }

    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.keys().map(String::as_str).collect()
    }

    /// Manager of `name`, or `UnknownSegment`
    pub fn segment(&self, name: &str) -> Result<&CacheManager<V>> {
        self.entry(name).map(|segment| &segment.manager)
    }

    pub fn segment_config(&self, name: &str) -> Result<&SegmentConfig> {
        self.entry(name).map(|segment| &segment.config)
    }

    fn entry(&self, name: &str) -> Result<&Segment<V>> {
        self.segments
            .get(name)
            .ok_or_else(|| CacheError::UnknownSegment(name.to_string()))
    }

    pub async fn get(&self, segment: &str, key: &str) -> Result<Option<V>> {
        Ok(self.segment(segment)?.get(key).await)
    }

    pub async fn get_with_refresh<F, Fut>(
        &self,
        segment: &str,
        key: &str,
        refresh: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Ok(self.segment(segment)?.get_with_refresh(key, refresh).await)
    }

    pub async fn get_or_compute<F, Fut>(
        &self,
        segment: &str,
        key: &str,
        compute: F,
        options: SetOptions,
    ) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.segment(segment)?
            .get_or_compute(key, compute, options)
            .await
    }

    pub async fn set(&self, segment: &str, key: &str, value: V, options: SetOptions) -> Result<()> {
        self.segment(segment)?.set(key, value, options).await;
        Ok(())
    }

    pub async fn delete(&self, segment: &str, key: &str) -> Result<bool> {
        Ok(self.segment(segment)?.delete(key).await)
    }

    pub async fn invalidate_by_tag(&self, segment: &str, tag: &str) -> Result<usize> {
        self.segment(segment)?.invalidate_by_tag(tag).await
    }

    pub async fn invalidate_version(&self, segment: &str, version: &str) -> Result<usize> {
        self.segment(segment)?.invalidate_version(version).await
    }

    pub async fn clear(&self, segment: &str) -> Result<()> {
        self.segment(segment)?.clear().await;
        Ok(())
    }

    /// Clear every segment concurrently
    pub async fn clear_all(&self) {
        join_all(self.segments.values().map(|segment| segment.manager.clear())).await;
        info!(segments = self.segments.len(), "All cache segments cleared");
    }

    pub fn calculate_adaptive_ttl(
        &self,
        segment: &str,
        key: &str,
        base: Duration,
    ) -> Result<Duration> {
        Ok(self.segment(segment)?.calculate_adaptive_ttl(key, base))
    }

    /// Register an observer receiving annotated events of every segment
    pub fn add_observer(&self, observer: Arc<dyn CacheObserver>) {
        self.events.subscribe(observer);
    }

    /// Stream of annotated events; slow receivers observe `Lagged`
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Stats of the local level of every segment
    pub fn stats(&self) -> BTreeMap<String, StoreStats> {
        self.segments
            .iter()
            .filter_map(|(name, segment)| {
                segment
                    .manager
                    .stats()
                    .into_iter()
                    .next()
                    .map(|stats| (name.clone(), stats))
            })
            .collect()
    }

    /// Start the periodic sweep of every segment; no-op when running
    pub fn start_maintenance(&self) {
        let mut handles = self.maintenance.lock();
        if !handles.is_empty() {
            return;
        }
        let interval = self.config.cleanup_interval();
        handles.extend(
            self.segments
                .values()
                .map(|segment| segment.manager.start_maintenance(interval)),
        );
    }

    pub fn is_maintenance_running(&self) -> bool {
        !self.maintenance.lock().is_empty()
    }

    /// Stop every maintenance task and wait for them
    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.maintenance.lock());
        let count = handles.len();
        join_all(handles.into_iter().map(MaintenanceHandle::shutdown)).await;
        info!(tasks = count, "Cache system shut down");
    }
}

/// Observer stamping segment events and forwarding them to the system bus
fn relay(segment: &str, environment: Environment, target: EventBus) -> Arc<dyn CacheObserver> {
    let segment = segment.to_string();
    Arc::new(move |event: &CacheEvent| {
        let mut event = event.clone();
        event.segment = Some(segment.clone());
        event.environment = Some(environment);
        target.emit(event);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_segments_registered() {
        let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();
        assert_eq!(
            system.segment_names(),
            vec!["analytics", "metrics", "posts", "profiles", "scans"]
        );
        assert!(system.segment("posts").is_ok());
    }

    #[tokio::test]
    async fn test_unknown_segment() {
        let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();
        let err = system.get("nope", "k").await.unwrap_err();
        assert!(matches!(err, CacheError::UnknownSegment(ref name) if name == "nope"));
        assert!(system.set("nope", "k", 1, SetOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_development_ignores_remote_factory() {
        let system: CacheSystem<i32> = CacheSystem::with_remote(SystemConfig::default(), |_| {
            let backend: Arc<dyn RemoteBackend<i32>> =
                Arc::new(crate::cache::MemoryBackend::new("mem"));
            backend
        })
        .unwrap();
        assert!(!system.segment("posts").unwrap().has_remote());
    }

    #[tokio::test]
    async fn test_maintenance_lifecycle() {
        let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();
        system.start_maintenance();
        system.start_maintenance();
        assert!(system.is_maintenance_running());
        assert_eq!(system.maintenance.lock().len(), 5);

        system.shutdown().await;
        assert!(!system.is_maintenance_running());
    }
}
