//! Segment registry
//!
//! A segment is a named data domain (posts, profiles, scans, ...) with its
//! own tuning, derived from the system defaults by a [`SegmentProfile`].

mod profile;
mod system;

pub use profile::{SegmentConfig, SegmentProfile, resolve_segments};
pub use system::{CacheSystem, RemoteFactory};
