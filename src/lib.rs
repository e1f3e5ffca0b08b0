//! # nemo-stream
//!
//! Pre-resolved audio streams for a curated catalog of videos.
//!
//! Resolving a playable URL means a slow, rate-limited trip through an
//! external extractor. This crate hides that behind a memory-resident cache:
//!
//! - [`cache::StreamCache`]: single-flight memoized lookups, bulk lookups with
//!   a bounded worker pool, manual invalidation
//! - [`cache::TtlGate`]: coarse epoch timer deciding when everything is stale
//! - [`refresh::RefreshOrchestrator`]: category/catalog refreshes, background
//!   warmups, TTL watchdog, clearing the secondary store
//! - [`sources::Resolver`]: the extraction capability, implemented by
//!   [`sources::YtDlpResolver`]
//! - [`catalog::Catalog`]: the static category → ids mapping
//!
//! The HTTP layer is not part of this crate; it holds an
//! `Arc<RefreshOrchestrator>` and serializes [`sources::StreamRecord`] or
//! [`error::ErrorPayload`] bodies.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod refresh;
pub mod sources;
pub mod storage;
