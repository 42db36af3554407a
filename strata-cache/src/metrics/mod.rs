//! Cache metric events
//!
//! Every store/manager operation produces a [`CacheEvent`] that is handed to
//! the observers registered on an [`EventBus`]:
//! - observers run synchronously on the calling thread
//! - a panicking observer is isolated and logged, the cache operation proceeds
//! - buses are owned by their manager/system, there is no global registry

mod exporter;

pub use exporter::{PrometheusObserver, encode_metrics};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::cache::Capability;
use crate::config::Environment;

/// Cache operation that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Set,
    Delete,
    Invalidate,
    Clear,
    Evict,
    Expire,
    Revalidate,
    Promote,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
            Self::Clear => "clear",
            Self::Evict => "evict",
            Self::Expire => "expire",
            Self::Revalidate => "revalidate",
            Self::Promote => "promote",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Hit,
    /// Served past expiry inside the SWR window
    Stale,
    Miss,
    Ok,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Stale => "stale",
            Self::Miss => "miss",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured metric event
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    pub operation: Operation,
    pub key: String,
    pub outcome: Outcome,
    pub latency_ms: f64,
    /// Level that served or failed the operation, if any
    pub level: Option<Capability>,
    /// Set by the segment relay
    pub segment: Option<String>,
    /// Set by the segment relay
    pub environment: Option<Environment>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl CacheEvent {
    pub fn new(
        operation: Operation,
        key: impl Into<String>,
        outcome: Outcome,
        latency: Duration,
    ) -> Self {
        Self {
            operation,
            key: key.into(),
            outcome,
            latency_ms: latency.as_secs_f64() * 1000.0,
            level: None,
            segment: None,
            environment: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn with_level(mut self, level: Capability) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receives cache events
pub trait CacheObserver: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

impl<F> CacheObserver for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Observer list owned by a store, manager or system
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Arc<dyn CacheObserver>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn CacheObserver>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver an event to every observer
    pub fn emit(&self, event: CacheEvent) {
        // Snapshot so observers may subscribe re-entrantly
        let observers = self.observers.read().clone();
        for observer in &observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                warn!(
                    operation = %event.operation,
                    key = %event.key,
                    "cache observer panicked, event dropped for this observer"
                );
            }
        }
    }
}

/// Forwards events into a broadcast channel
pub struct BroadcastObserver {
    sender: broadcast::Sender<CacheEvent>,
}

impl BroadcastObserver {
    pub fn new(sender: broadcast::Sender<CacheEvent>) -> Self {
        Self { sender }
    }
}

impl CacheObserver for BroadcastObserver {
    fn on_event(&self, event: &CacheEvent) {
        // No receivers is fine
        let _ = self.sender.send(event.clone());
    }
}
