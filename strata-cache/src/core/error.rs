use thiserror::Error;

/// Main error type for Strata cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown segment: {0}")]
    UnknownSegment(String),

    #[error("Backend error ({backend}): {message}")]
    Backend { backend: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Revalidation failed: {0}")]
    Revalidation(String),

    #[error("Invalidation of {target} failed: {}", .failures.join("; "))]
    Invalidation {
        target: String,
        failures: Vec<String>,
    },
}

/// Coarse classification used by callers deciding whether to fail open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at setup time
    Configuration,
    /// Remote level failure, recovered as a miss/no-op
    Backend,
    /// Refresh callback failure, recovered by keeping the stale value
    Revalidation,
    /// Bulk invalidation failure, always surfaced
    Invalidation,
}

impl CacheError {
    /// Get the error category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::UnknownSegment(_) => ErrorKind::Configuration,
            Self::Backend { .. } | Self::Serialization(_) => ErrorKind::Backend,
            Self::Revalidation(_) => ErrorKind::Revalidation,
            Self::Invalidation { .. } => ErrorKind::Invalidation,
        }
    }

    /// Whether the cache should degrade to a miss instead of surfacing this error
    pub fn is_fail_open(&self) -> bool {
        matches!(self.kind(), ErrorKind::Backend | ErrorKind::Revalidation)
    }

    pub(crate) fn backend(backend: &str, message: impl ToString) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::backend("redis", err)
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, CacheError>;
