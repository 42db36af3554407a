use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::{AdaptiveTtlPolicy, ManagerConfig};
use crate::config::{SegmentOverride, SystemConfig};
use crate::core::types::scale_duration;
use crate::core::{CacheError, MAX_TTL, Result, StoreConfig};

/// Multipliers applied to the system defaults for one data domain
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentProfile {
    pub name: String,
    pub ttl_factor: f64,
    pub size_factor: f64,
    pub swr_factor: f64,
    pub adaptive_ttl: bool,
    pub version: Option<String>,
}

impl SegmentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_factor: 1.0,
            size_factor: 1.0,
            swr_factor: 1.0,
            adaptive_ttl: false,
            version: None,
        }
    }

    fn scaled(mut self, ttl: f64, size: f64, swr: f64, adaptive_ttl: bool) -> Self {
        self.ttl_factor = ttl;
        self.size_factor = size;
        self.swr_factor = swr;
        self.adaptive_ttl = adaptive_ttl;
        self
    }

    /// Built-in domains
    pub fn builtin() -> Vec<SegmentProfile> {
        vec![
            Self::new("posts").scaled(1.0, 1.0, 1.0, true),
            Self::new("profiles").scaled(2.0, 1.0, 2.0, true),
            Self::new("scans").scaled(4.0, 0.5, 1.0, false),
            Self::new("analytics").scaled(1.5, 1.0, 2.0, false),
            Self::new("metrics").scaled(0.5, 2.0, 0.5, false),
        ]
    }

    pub fn apply(&mut self, overrides: &SegmentOverride) {
        if let Some(factor) = overrides.ttl_factor {
            self.ttl_factor = factor;
        }
        if let Some(factor) = overrides.size_factor {
            self.size_factor = factor;
        }
        if let Some(factor) = overrides.swr_factor {
            self.swr_factor = factor;
        }
        if let Some(adaptive) = overrides.adaptive_ttl {
            self.adaptive_ttl = adaptive;
        }
        if overrides.version.is_some() {
            self.version.clone_from(&overrides.version);
        }
    }

    /// Scale the system defaults by this profile
    pub fn resolve(&self, config: &SystemConfig) -> Result<SegmentConfig> {
        let defaults = config.default_store_config();
        let scale = |count: usize| ((count as f64) * self.size_factor).round().max(1.0) as usize;

        let scale_window = |base: Duration, factor: f64, field: &str| {
            scale_duration(base, factor).ok_or_else(|| {
                CacheError::InvalidConfig(format!(
                    "segment '{}': {field} {factor} scales {base:?} beyond {MAX_TTL:?}",
                    self.name
                ))
            })
        };

        let store = StoreConfig {
            ttl: scale_window(defaults.ttl, self.ttl_factor, "ttl_factor")?,
            max_size: scale(defaults.max_size),
            stale_while_revalidate: scale_window(
                defaults.stale_while_revalidate,
                self.swr_factor,
                "swr_factor",
            )?,
            version: self.version.clone().or(defaults.version),
            max_bytes: defaults.max_bytes.map(scale),
        };
        store.validate()?;

        let adaptive_ttl = if self.adaptive_ttl {
            Some(AdaptiveTtlPolicy::relative_to(
                store.ttl,
                config.adaptive.floor_ratio,
                config.adaptive.ceiling_ratio,
                config.adaptive.weight,
            )?)
        } else {
            None
        };

        Ok(SegmentConfig {
            name: self.name.clone(),
            store,
            adaptive_ttl,
        })
    }
}

/// Fully resolved configuration of one segment
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub name: String,
    pub store: StoreConfig,
    pub adaptive_ttl: Option<AdaptiveTtlPolicy>,
}

impl SegmentConfig {
    pub fn ttl(&self) -> Duration {
        self.store.ttl
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            name: self.name.clone(),
            default_ttl: self.store.ttl,
            version: self.store.version.clone(),
            adaptive_ttl: self.adaptive_ttl,
            max_tracked_keys: self.store.max_size.saturating_mul(2),
            ..Default::default()
        }
    }
}

/// Built-in profiles merged with the configured overrides, keyed by name
pub fn resolve_segments(config: &SystemConfig) -> Result<BTreeMap<String, SegmentConfig>> {
    let mut profiles: BTreeMap<String, SegmentProfile> = SegmentProfile::builtin()
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();

    for (name, overrides) in &config.segments {
        profiles
            .entry(name.clone())
            .or_insert_with(|| SegmentProfile::new(name.clone()))
            .apply(overrides);
    }

    profiles
        .into_iter()
        .map(|(name, profile)| Ok((name, profile.resolve(config)?)))
        .collect()
}
