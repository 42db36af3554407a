//! Multi-level cache management
//!
//! A [`CacheManager`] chains local [`CacheStore`](crate::core::CacheStore)s
//! and [`RemoteBackend`]s into one logical cache. Levels are probed in
//! descending priority; the local tier is authoritative within a process and
//! remote levels are a best-effort accelerator for cross-process reuse.

mod adaptive;
mod backend;
mod manager;
mod redis_backend;
mod tags;

pub use adaptive::AdaptiveTtlPolicy;
pub use backend::{Capability, MemoryBackend, RemoteBackend};
pub use manager::{CacheLevel, CacheManager, LevelHandle, ManagerBuilder, ManagerConfig};
pub use redis_backend::RedisBackend;
