//! # Sources Module
//!
//! Stream resolution against external video sources.
//!
//! A [`Resolver`] turns a `(category, video_id)` pair into a [`StreamRecord`]:
//! a directly playable audio URL plus the metadata shown to listeners. The
//! resolver knows nothing about caching; memoization, single-flight and
//! invalidation all live in [`crate::cache`].
//!
//! ## Resolvers
//!
//! - [`ytdlp::YtDlpResolver`]: runs `yt-dlp --dump-json` and picks the best
//!   audio-only format
//!
//! Resolvers never retry. A failed call is reported as a
//! [`ResolutionError`](crate::error::ResolutionError) and the caller decides
//! what to do with it.

pub mod ytdlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ResolutionError;

pub use ytdlp::YtDlpResolver;

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub category: String,
    pub video_id: String,
}

impl StreamKey {
    pub fn new(category: impl Into<String>, video_id: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            video_id: video_id.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category, self.video_id)
    }
}

/// Resolved, playable stream for one video.
///
/// Serialized with the field names API clients already consume:
/// `category`, `title`, `author`, `id`, `duration`, `url`, `expiry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub category: String,
    pub title: String,
    pub author: String,
    #[serde(rename = "id")]
    pub video_id: String,
    /// `HH:MM:SS`
    pub duration: String,
    #[serde(rename = "url")]
    pub play_url: String,
    /// Moment the upstream signs the play URL off (unix seconds on the wire)
    #[serde(rename = "expiry", with = "chrono::serde::ts_seconds")]
    pub expiry_timestamp: DateTime<Utc>,
}

impl StreamRecord {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.category.clone(), self.video_id.clone())
    }

    /// True once `now` is within `margin` of the record's own expiry.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match self.expiry_timestamp.checked_sub_signed(margin) {
            Some(deadline) => deadline <= now,
            None => true,
        }
    }
}

/// External extraction capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves one video into a playable stream record
    async fn resolve(&self, category: &str, video_id: &str) -> Result<StreamRecord, ResolutionError>;

    /// Drops whatever the extractor keeps on disk between runs
    async fn purge_external_cache(&self) -> anyhow::Result<()>;

    /// Nombre del resolver
    fn name(&self) -> &'static str;
}

/// Formats a duration as `HH:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
