use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cache::AdaptiveTtlPolicy;
use crate::core::{CacheError, Result, StoreConfig};
use crate::segment::resolve_segments;

/// Deployment environment; gates the remote level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }

    /// Remote levels are never attached in development
    pub fn allows_remote(&self) -> bool {
        !matches!(self, Self::Development)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration of a `CacheSystem`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Key prefix for remote levels
    pub namespace: String,
    pub environment: Environment,
    /// Redis URL of the remote level
    pub remote_url: Option<String>,
    /// Version tag stamped on every entry
    pub version: Option<String>,
    pub defaults: CacheDefaults,
    pub adaptive: AdaptiveConfig,
    pub cleanup_interval_ms: u64,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    pub logging: LoggingConfig,
    /// Per-segment overrides and additional segments
    pub segments: BTreeMap<String, SegmentOverride>,
}

/// Defaults every segment profile is scaled from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheDefaults {
    pub ttl_ms: u64,
    pub max_size: usize,
    pub stale_while_revalidate_ms: u64,
    pub max_bytes: Option<usize>,
}

/// Adaptive TTL bounds as ratios of a segment's base TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub floor_ratio: f64,
    pub ceiling_ratio: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Multipliers overriding a built-in profile, or declaring a new segment
///
/// Unset factors keep the built-in value (1.0 for new segments).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentOverride {
    pub ttl_factor: Option<f64>,
    pub size_factor: Option<f64>,
    pub swr_factor: Option<f64>,
    pub adaptive_ttl: Option<bool>,
    /// Version tag for this segment only
    pub version: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            namespace: "strata".to_string(),
            environment: Environment::Development,
            remote_url: None,
            version: None,
            defaults: CacheDefaults::default(),
            adaptive: AdaptiveConfig::default(),
            cleanup_interval_ms: 30_000,
            event_buffer: 1024,
            logging: LoggingConfig::default(),
            segments: BTreeMap::new(),
        }
    }
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_size: 10_000,
            stale_while_revalidate_ms: 60_000,
            max_bytes: None,
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            floor_ratio: 0.5,
            ceiling_ratio: 4.0,
            weight: 0.5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl SystemConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: SystemConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(CacheError::InvalidConfig(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(CacheError::InvalidConfig(
                "event_buffer must be > 0".to_string(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "cleanup_interval_ms must be > 0".to_string(),
            ));
        }

        self.default_store_config().validate()?;
        AdaptiveTtlPolicy::relative_to(
            self.default_store_config().ttl,
            self.adaptive.floor_ratio,
            self.adaptive.ceiling_ratio,
            self.adaptive.weight,
        )?;

        for (name, overrides) in &self.segments {
            if name.is_empty() || name.contains(':') {
                return Err(CacheError::InvalidConfig(format!(
                    "invalid segment name '{name}'"
                )));
            }
            overrides.validate(name)?;
        }

        // Scaled segment windows must stay within the store limits
        resolve_segments(self)?;
        Ok(())
    }

    /// Store configuration before any segment scaling
    pub fn default_store_config(&self) -> StoreConfig {
        StoreConfig {
            ttl: Duration::from_millis(self.defaults.ttl_ms),
            max_size: self.defaults.max_size,
            stale_while_revalidate: Duration::from_millis(self.defaults.stale_while_revalidate_ms),
            version: self.version.clone(),
            max_bytes: self.defaults.max_bytes,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl SegmentOverride {
    fn validate(&self, segment: &str) -> Result<()> {
        let factors = [
            ("ttl_factor", self.ttl_factor),
            ("size_factor", self.size_factor),
            ("swr_factor", self.swr_factor),
        ];
        for (field, factor) in factors {
            if let Some(value) = factor {
                // swr may be disabled entirely
                let min_ok = if field == "swr_factor" {
                    value >= 0.0
                } else {
                    value > 0.0
                };
                if !value.is_finite() || !min_ok {
                    return Err(CacheError::InvalidConfig(format!(
                        "segment '{segment}': {field} out of range: {value}"
                    )));
                }
            }
        }
        Ok(())
    }
}
