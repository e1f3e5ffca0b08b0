//! Error types shared by the catalog, the resolvers and the cache.
//!
//! Every error here is `Clone`: a single-flight resolution hands the same
//! result to every waiter on the key.

use serde::Serialize;
use thiserror::Error;

/// Why the extractor could not produce a stream for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// The id does not look like an external video id
    InvalidId,
    /// The source reports the video as missing, private or removed
    NotFound,
    /// Upstream throttling (HTTP 429 and friends)
    RateLimited,
    /// The extraction did not finish in time
    Timeout,
    /// Transport-level failure or the extractor could not be started
    Network,
    /// Anything else the extractor complained about
    Extractor,
}

impl ResolutionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionFailure::InvalidId => "invalid_id",
            ResolutionFailure::NotFound => "not_found",
            ResolutionFailure::RateLimited => "rate_limited",
            ResolutionFailure::Timeout => "timeout",
            ResolutionFailure::Network => "network",
            ResolutionFailure::Extractor => "extractor",
        }
    }
}

impl std::fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single resolver call.
#[derive(Debug, Clone, Error)]
#[error("No se pudo resolver {category}/{video_id} ({kind}): {reason}")]
pub struct ResolutionError {
    pub category: String,
    pub video_id: String,
    pub kind: ResolutionFailure,
    pub reason: String,
}

impl ResolutionError {
    pub fn new(
        category: impl Into<String>,
        video_id: impl Into<String>,
        kind: ResolutionFailure,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            video_id: video_id.into(),
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The requested category is not part of the catalog
    #[error("Invalid category: {category}. Should be one of {valid:?}")]
    InvalidCategory { category: String, valid: Vec<String> },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Catalog file missing or malformed; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("The stream cache has been shut down")]
    ShutDown,
}

impl StreamError {
    pub fn is_invalid_category(&self) -> bool {
        matches!(self, StreamError::InvalidCategory { .. })
    }

    /// Body returned to API clients in place of a record.
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
        }
    }
}

/// JSON error body: `{ "message": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}
