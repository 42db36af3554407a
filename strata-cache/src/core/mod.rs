pub mod error;
pub mod store;
pub mod types;

pub use error::{CacheError, ErrorKind, Result};
pub use store::{CacheStore, CacheValue, RevalidationHandle};
pub use types::{
    CacheKey, ClearOptions, EntryInfo, EntryState, EvictionPolicy, MAX_TTL, SetOptions,
    StoreConfig, StoreStats, Weigher,
};
