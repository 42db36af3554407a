pub mod cache;
pub mod config;
pub mod core;
pub mod logging;
pub mod maintenance;
pub mod metrics;
pub mod segment;

// Re-export commonly used types
pub use cache::{
    AdaptiveTtlPolicy, CacheLevel, CacheManager, Capability, ManagerConfig, MemoryBackend,
    RedisBackend, RemoteBackend,
};
pub use config::{Environment, LogFormat, LoggingConfig, SegmentOverride, SystemConfig};
pub use core::{
    CacheError, CacheStore, CacheValue, ClearOptions, EntryInfo, EntryState, ErrorKind, MAX_TTL,
    Result, SetOptions, StoreConfig, StoreStats,
};
pub use maintenance::MaintenanceHandle;
pub use metrics::{CacheEvent, CacheObserver, EventBus, Operation, Outcome, PrometheusObserver};
pub use segment::{CacheSystem, SegmentConfig, SegmentProfile};
