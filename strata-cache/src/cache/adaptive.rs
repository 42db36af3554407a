//! Adaptive TTL
//!
//! Frequently read keys live longer. The TTL for a key is
//!
//! ```text
//! ttl = clamp(base * (1 + weight * ln(1 + accesses)), floor, ceiling)
//! ```
//!
//! which is monotonic non-decreasing in the access count. Counts are
//! halved on every maintenance tick so they reflect recent traffic.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::types::scale_duration;
use crate::core::{CacheError, MAX_TTL, Result};

/// Bounds and weight of the adaptive TTL curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveTtlPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
    /// Growth per natural-log unit of accesses
    pub weight: f64,
}

impl AdaptiveTtlPolicy {
    pub fn new(floor: Duration, ceiling: Duration, weight: f64) -> Result<Self> {
        if floor.is_zero() {
            return Err(CacheError::InvalidConfig(
                "adaptive ttl floor must be > 0".to_string(),
            ));
        }
        if floor > ceiling {
            return Err(CacheError::InvalidConfig(format!(
                "adaptive ttl floor {floor:?} exceeds ceiling {ceiling:?}"
            )));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(CacheError::InvalidConfig(format!(
                "adaptive ttl weight must be a finite non-negative number, got {weight}"
            )));
        }
        Ok(Self {
            floor,
            ceiling,
            weight,
        })
    }

    /// Policy whose bounds are ratios of `base`
    pub fn relative_to(
        base: Duration,
        floor_ratio: f64,
        ceiling_ratio: f64,
        weight: f64,
    ) -> Result<Self> {
        if !(floor_ratio.is_finite() && ceiling_ratio.is_finite()) || floor_ratio <= 0.0 {
            return Err(CacheError::InvalidConfig(format!(
                "adaptive ttl ratios must be finite and > 0, got {floor_ratio}/{ceiling_ratio}"
            )));
        }
        let scaled = |ratio: f64| {
            scale_duration(base, ratio).ok_or_else(|| {
                CacheError::InvalidConfig(format!(
                    "adaptive ttl bound {base:?} x {ratio} exceeds {MAX_TTL:?}"
                ))
            })
        };
        Self::new(
            scaled(floor_ratio)?,
            scaled(ceiling_ratio.max(floor_ratio))?,
            weight,
        )
    }

    pub fn compute(&self, base: Duration, accesses: u64) -> Duration {
        let factor = 1.0 + self.weight * (accesses as f64).ln_1p();
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.ceiling)
            .clamp(self.floor, self.ceiling)
    }
}

/// Recent access counts per key, bounded in size
pub(crate) struct AccessTracker {
    counts: Mutex<HashMap<String, u64>>,
    max_keys: usize,
}

impl AccessTracker {
    pub fn new(max_keys: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max_keys,
        }
    }

    /// Count one access; untracked keys beyond the bound stay at zero
    pub fn record(&self, key: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(key) {
            *count = count.saturating_add(1);
        } else if counts.len() < self.max_keys {
            counts.insert(key.to_string(), 1);
        }
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        self.counts.lock().remove(key);
    }

    /// Halve every count and drop keys that reach zero
    pub fn decay(&self) {
        self.counts.lock().retain(|_, count| {
            *count /= 2;
            *count > 0
        });
    }

    pub fn clear(&self) {
        self.counts.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }
}
