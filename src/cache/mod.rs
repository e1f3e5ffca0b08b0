//! # Cache Module
//!
//! Memory-resident cache of resolved audio streams.
//!
//! [`StreamCache`] memoizes [`Resolver`] calls per `(category, video_id)` and
//! guarantees single-flight: while a key is being resolved, every other caller
//! asking for it awaits the same upstream call instead of issuing its own.
//!
//! ## Invalidation
//!
//! - **Coarse**: [`TtlGate`] decides when the whole cache is stale; the
//!   refresh orchestrator then calls [`StreamCache::invalidate_all`]
//! - **Per record**: an entry within `RECORD_EXPIRY_MARGIN_SECS` of its own
//!   `expiry` is treated as missing and resolved again
//! - **Manual**: [`StreamCache::invalidate_all`] from the API layer
//!
//! Entries are never evicted one by one otherwise; the catalog is small and
//! fixed, so the cache is bounded by it.
//!
//! ## Configuration
//!
//! ```env
//! LOOKUP_WORKERS=10              # get_many width
//! RECORD_EXPIRY_MARGIN_SECS=300  # re-resolve records this close to expiry
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use nemo_stream::{cache::StreamCache, catalog::Catalog, config::Config, sources::YtDlpResolver};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
//! let resolver = Arc::new(YtDlpResolver::from_config(&config));
//! let cache = StreamCache::new(catalog, resolver, &config);
//!
//! let record = cache.get("lofi", "jfKfPfyJRdk").await?;
//! println!("{} -> {}", record.title, record.play_url);
//! # Ok(())
//! # }
//! ```

pub mod ttl_gate;

pub use ttl_gate::TtlGate;

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::StreamError;
use crate::sources::{Resolver, StreamKey, StreamRecord};

/// Result of one key in a bulk lookup.
pub type KeyedResult = (StreamKey, Result<StreamRecord, StreamError>);

type Flight = Shared<BoxFuture<'static, Result<StreamRecord, StreamError>>>;

/// In-flight resolution tagged with the generation it started in.
#[derive(Clone)]
struct PendingFlight {
    generation: u64,
    flight: Flight,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    resolutions: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    /// Upstream resolver calls issued
    pub resolutions: u64,
    pub failures: u64,
    pub entries: usize,
    pub in_flight: usize,
    pub hit_ratio: f64,
}

/// Single-flight memoized store over a [`Resolver`].
pub struct StreamCache {
    catalog: Arc<Catalog>,
    resolver: Arc<dyn Resolver>,
    entries: Arc<DashMap<StreamKey, StreamRecord>>,
    in_flight: Arc<DashMap<StreamKey, PendingFlight>>,
    // Se incrementa en cada invalidación
    generation: Arc<AtomicU64>,
    closed: AtomicBool,
    lookup_workers: usize,
    expiry_margin: Duration,
    stats: Arc<CacheStats>,
}

impl StreamCache {
    pub fn new(catalog: Arc<Catalog>, resolver: Arc<dyn Resolver>, config: &Config) -> Self {
        info!(
            "🗄️ Caché de streams iniciada: {} videos en catálogo, resolver {}, {} workers",
            catalog.len(),
            resolver.name(),
            config.lookup_workers
        );

        Self {
            catalog,
            resolver,
            entries: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            lookup_workers: config.lookup_workers.max(1),
            expiry_margin: config.record_expiry_margin,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Returns the cached record or resolves it.
    ///
    /// Fails with [`StreamError::InvalidCategory`] before touching the
    /// resolver when the category is not in the catalog.
    pub async fn get(&self, category: &str, video_id: &str) -> Result<StreamRecord, StreamError> {
        self.ensure_open()?;
        if !self.catalog.contains(category) {
            return Err(self.catalog.invalid_category(category));
        }

        self.get_key(StreamKey::new(category, video_id)).await
    }

    /// Resolves every key with at most `LOOKUP_WORKERS` resolutions in flight.
    ///
    /// Results come back in input order; a failing key only fails its own slot.
    pub async fn get_many(&self, keys: Vec<StreamKey>) -> Vec<KeyedResult> {
        self.get_many_with(keys, self.lookup_workers).await
    }

    /// [`get_many`](Self::get_many) with an explicit pool width.
    pub async fn get_many_with(&self, keys: Vec<StreamKey>, workers: usize) -> Vec<KeyedResult> {
        stream::iter(keys)
            .map(|key| async move {
                let result = self.get(&key.category, &key.video_id).await;
                (key, result)
            })
            .buffered(workers.max(1))
            .collect()
            .await
    }

    /// Every stream of a category, in catalog order.
    pub async fn get_category(&self, category: &str) -> Result<Vec<KeyedResult>, StreamError> {
        self.ensure_open()?;
        let keys = self.catalog.keys(category)?;
        Ok(self.get_many(keys).await)
    }

    /// Clears every entry and purges the extractor's own cache.
    ///
    /// Resolutions already in flight still answer their callers, but their
    /// results are not stored, and later lookups start a new resolution
    /// instead of joining them.
    pub async fn invalidate_all(&self) {
        let dropped = self.clear_entries();
        info!("🧹 Caché invalidada: {} entradas eliminadas", dropped);

        if let Err(e) = self.resolver.purge_external_cache().await {
            warn!("⚠️ No se pudo limpiar la caché de {}: {}", self.resolver.name(), e);
        }
    }

    /// Cached record without resolving, honouring per-record expiry.
    pub fn peek(&self, category: &str, video_id: &str) -> Option<StreamRecord> {
        self.lookup(&StreamKey::new(category, video_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStatistics {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStatistics {
            hits,
            misses,
            resolutions: self.stats.resolutions.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            entries: self.entries.len(),
            in_flight: self.in_flight.len(),
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Rejects further lookups and drops every entry.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.clear_entries();
        info!("⚠️ Caché de streams cerrada ({} entradas descartadas)", dropped);
    }

    // Métodos privados

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            Err(StreamError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn get_key(&self, key: StreamKey) -> Result<StreamRecord, StreamError> {
        if let Some(record) = self.lookup(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!("✅ Cache hit: {}", key);
            return Ok(record);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let flight = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let current = self.generation.load(Ordering::SeqCst);
                if slot.get().generation == current {
                    debug!("⏳ Esperando resolución en curso: {}", key);
                    slot.get().flight.clone()
                } else {
                    // Empezó antes de la última invalidación: no sirve
                    debug!("🔁 Resolución obsoleta reemplazada: {}", key);
                    let pending = self.start_flight(key.clone());
                    slot.insert(pending.clone());
                    pending.flight
                }
            }
            Entry::Vacant(slot) => {
                // Una resolución pudo terminar entre la consulta y el registro
                if let Some(record) = self.lookup(&key) {
                    return Ok(record);
                }
                debug!("❌ Cache miss, resolviendo: {}", key);
                let pending = self.start_flight(key.clone());
                slot.insert(pending.clone());
                pending.flight
            }
        };

        flight.await
    }

    fn lookup(&self, key: &StreamKey) -> Option<StreamRecord> {
        let now = Utc::now();
        let margin = self.expiry_margin;

        {
            let entry = self.entries.get(key)?;
            if !entry.expires_within(now, margin) {
                return Some(entry.value().clone());
            }
        }

        if self
            .entries
            .remove_if(key, |_, record| record.expires_within(now, margin))
            .is_some()
        {
            debug!("⏰ URL de stream expirada removida: {}", key);
        }
        None
    }

    fn start_flight(&self, key: StreamKey) -> PendingFlight {
        let resolver = Arc::clone(&self.resolver);
        let entries = Arc::clone(&self.entries);
        let in_flight = Arc::clone(&self.in_flight);
        let generation = Arc::clone(&self.generation);
        let stats = Arc::clone(&self.stats);
        let margin = self.expiry_margin;
        let started_in = generation.load(Ordering::SeqCst);

        let flight = async move {
            let result = resolver.resolve(&key.category, &key.video_id).await;
            stats.resolutions.fetch_add(1, Ordering::Relaxed);

            match &result {
                Ok(record) if record.expires_within(Utc::now(), margin) => {
                    warn!(
                        "⚠️ {} devolvió una URL que vence en menos de {}, no se cachea: {}",
                        resolver.name(),
                        humantime::format_duration(margin),
                        key
                    );
                }
                Ok(record) => {
                    // Generación comprobada con la entrada bloqueada
                    let slot = entries.entry(key.clone());
                    if generation.load(Ordering::SeqCst) != started_in {
                        debug!("🗑️ Resultado descartado tras invalidación: {}", key);
                    } else {
                        slot.insert(record.clone());
                        debug!("💾 Stream almacenado en caché: {}", key);
                    }
                }
                Err(e) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    debug!("❌ Resolución fallida {}: {}", key, e);
                }
            }

            // Solo se quita a sí misma, nunca a su reemplazo
            in_flight.remove_if(&key, |_, pending| pending.generation == started_in);
            result.map_err(StreamError::from)
        }
        .boxed()
        .shared();

        PendingFlight {
            generation: started_in,
            flight,
        }
    }

    fn clear_entries(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ResolutionError, ResolutionFailure};
    use crate::sources::testing::FakeResolver;
    use crate::sources::MockResolver;
    use pretty_assertions::assert_eq;

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::from_json(r#"{"jazz": ["a1", "a2", "a3"], "lofi": ["b1"]}"#).unwrap(),
        )
    }

    fn cache_with(resolver: Arc<FakeResolver>) -> StreamCache {
        StreamCache::new(catalog(), resolver, &Config::default())
    }

    fn keys(ids: &[&str]) -> Vec<StreamKey> {
        ids.iter().map(|id| StreamKey::new("jazz", *id)).collect()
    }

    #[tokio::test]
    async fn test_get_returns_requested_category_for_every_catalog_pair() {
        let resolver = Arc::new(FakeResolver::new());
        let cache = cache_with(resolver.clone());

        for key in catalog().all_keys() {
            let record = cache.get(&key.category, &key.video_id).await.unwrap();
            assert_eq!(record.category, key.category);
            assert_eq!(record.video_id, key.video_id);
        }
        assert_eq!(resolver.calls(), 4);
    }

    #[tokio::test]
    async fn test_invalid_category_never_reaches_resolver() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().never();
        resolver.expect_name().return_const("mock");

        let cache = StreamCache::new(catalog(), Arc::new(resolver), &Config::default());
        let err = cache.get("polka", "a1").await.unwrap_err();

        match err {
            StreamError::InvalidCategory { category, valid } => {
                assert_eq!(category, "polka");
                assert_eq!(valid, vec!["jazz", "lofi"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolver_receives_requested_key() {
        let mut resolver = MockResolver::new();
        resolver.expect_name().return_const("mock");
        resolver
            .expect_resolve()
            .withf(|category, video_id| category.to_string() == "lofi" && video_id.to_string() == "b1")
            .times(1)
            .returning(|category, video_id| {
                Ok(StreamRecord {
                    category: category.to_string(),
                    title: "Lofi Girl".to_string(),
                    author: "Lofi Girl".to_string(),
                    video_id: video_id.to_string(),
                    duration: "00:00:00".to_string(),
                    play_url: "https://stream.example/b1".to_string(),
                    expiry_timestamp: Utc::now() + chrono::Duration::hours(5),
                })
            });

        let cache = StreamCache::new(catalog(), Arc::new(resolver), &Config::default());
        let first = cache.get("lofi", "b1").await.unwrap();
        let second = cache.get("lofi", "b1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_repeated_get_hits_cache() {
        let resolver = Arc::new(FakeResolver::new());
        let cache = cache_with(resolver.clone());

        let first = cache.get("jazz", "a1").await.unwrap();
        let second = cache.get("jazz", "a1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.calls_for("jazz", "a1"), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.resolutions, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalidate_all_forces_exactly_one_new_resolution() {
        let resolver = Arc::new(FakeResolver::new());
        let cache = cache_with(resolver.clone());

        let before = cache.get("jazz", "a1").await.unwrap();
        cache.invalidate_all().await;

        assert!(cache.is_empty());
        assert_eq!(resolver.purges(), 1);

        let after = cache.get("jazz", "a1").await.unwrap();
        cache.get("jazz", "a1").await.unwrap();

        assert_eq!(resolver.calls_for("jazz", "a1"), 2);
        assert_ne!(before.play_url, after.play_url);
    }

    #[tokio::test]
    async fn test_get_many_preserves_input_order() {
        let resolver = Arc::new(
            FakeResolver::new()
                .with_delay("a1", Duration::from_millis(120))
                .with_delay("a2", Duration::from_millis(60)),
        );
        let cache = cache_with(resolver.clone());

        let results = cache.get_many(keys(&["a1", "a2", "a3"])).await;

        let order: Vec<_> = results.iter().map(|(key, _)| key.video_id.as_str()).collect();
        assert_eq!(order, vec!["a1", "a2", "a3"]);
        for (key, result) in &results {
            assert_eq!(result.as_ref().unwrap().video_id, key.video_id);
        }
    }

    #[tokio::test]
    async fn test_get_many_tolerates_partial_failure() {
        let resolver = Arc::new(FakeResolver::new().failing(&["a2"]));
        let cache = cache_with(resolver.clone());

        let results = cache.get_many(keys(&["a1", "a2", "a3"])).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert!(matches!(
            &results[1].1,
            Err(StreamError::Resolution(ResolutionError {
                kind: ResolutionFailure::NotFound,
                ..
            }))
        ));
        assert!(results[2].1.is_ok());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_get_many_reports_invalid_category_per_key() {
        let resolver = Arc::new(FakeResolver::new());
        let cache = cache_with(resolver.clone());

        let results = cache
            .get_many(vec![StreamKey::new("jazz", "a1"), StreamKey::new("polka", "x")])
            .await;

        assert!(results[0].1.is_ok());
        assert!(results[1].1.as_ref().unwrap_err().is_invalid_category());
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let resolver = Arc::new(FakeResolver::new().failing(&["a1"]));
        let cache = cache_with(resolver.clone());

        assert!(cache.get("jazz", "a1").await.is_err());
        assert!(cache.get("jazz", "a1").await.is_err());
        assert_eq!(resolver.calls_for("jazz", "a1"), 2);
        assert_eq!(cache.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_resolution() {
        let resolver = Arc::new(FakeResolver::new().with_default_delay(Duration::from_millis(50)));
        let cache = cache_with(resolver.clone());

        let results =
            futures::future::join_all((0..16).map(|_| cache.get("jazz", "a1"))).await;

        assert_eq!(resolver.calls_for("jazz", "a1"), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_share_one_resolution() {
        let resolver = Arc::new(FakeResolver::new().with_default_delay(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(resolver.clone()));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get("lofi", "b1").await })
            })
            .collect();

        let mut urls = Vec::new();
        for handle in handles {
            urls.push(handle.await.unwrap().unwrap().play_url);
        }

        assert_eq!(resolver.calls_for("lofi", "b1"), 1);
        urls.dedup();
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn test_record_near_its_own_expiry_is_resolved_again() {
        // 60s de vida con margen de 300s: nunca se sirve desde caché
        let resolver = Arc::new(
            FakeResolver::new().with_expiry(Utc::now() + chrono::Duration::seconds(60)),
        );
        let cache = cache_with(resolver.clone());

        cache.get("jazz", "a1").await.unwrap();
        assert_eq!(cache.peek("jazz", "a1"), None);
        assert!(cache.is_empty());
        cache.get("jazz", "a1").await.unwrap();

        assert_eq!(resolver.calls_for("jazz", "a1"), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_invalidation_during_resolution_discards_result() {
        let resolver = Arc::new(FakeResolver::new().with_delay("a1", Duration::from_millis(100)));
        let cache = Arc::new(cache_with(resolver.clone()));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("jazz", "a1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.invalidate_all().await;

        // El llamador recibe su resultado, pero no queda en caché
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(cache.peek("jazz", "a1"), None);

        cache.get("jazz", "a1").await.unwrap();
        assert_eq!(resolver.calls_for("jazz", "a1"), 2);
    }

    #[tokio::test]
    async fn test_get_after_invalidation_does_not_join_older_resolution() {
        let resolver = Arc::new(FakeResolver::new().with_delay("a1", Duration::from_millis(150)));
        let cache = Arc::new(cache_with(resolver.clone()));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("jazz", "a1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.invalidate_all().await;

        // La resolución anterior sigue pendiente
        let fresh = cache.get("jazz", "a1").await.unwrap();
        let stale = pending.await.unwrap().unwrap();

        assert_eq!(resolver.calls_for("jazz", "a1"), 2);
        assert_ne!(fresh.play_url, stale.play_url);
        assert_eq!(cache.peek("jazz", "a1"), Some(fresh));
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_stale_resolution_finishing_last_keeps_newer_record() {
        let resolver = Arc::new(FakeResolver::new().with_delay("a1", Duration::from_millis(150)));
        let cache = Arc::new(cache_with(resolver.clone()));

        let pending = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("jazz", "a1").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.invalidate_all().await;

        let replacement = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("jazz", "a1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // La antigua termina primero y no debe quitar a su reemplazo
        pending.await.unwrap().unwrap();
        assert_eq!(cache.stats().in_flight, 1);
        assert_eq!(cache.peek("jazz", "a1"), None);

        let joined = cache.get("jazz", "a1").await.unwrap();
        let fresh = replacement.await.unwrap().unwrap();
        assert_eq!(joined, fresh);
        assert_eq!(resolver.calls_for("jazz", "a1"), 2);
        assert_eq!(cache.peek("jazz", "a1"), Some(fresh));
    }

    #[tokio::test]
    async fn test_get_category_follows_catalog_order() {
        let resolver = Arc::new(FakeResolver::new().with_delay("a1", Duration::from_millis(50)));
        let cache = cache_with(resolver.clone());

        let results = cache.get_category("jazz").await.unwrap();
        let ids: Vec<_> = results
            .into_iter()
            .map(|(_, result)| result.unwrap().video_id)
            .collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);

        assert!(cache.get_category("polka").await.unwrap_err().is_invalid_category());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_lookups() {
        let resolver = Arc::new(FakeResolver::new());
        let cache = cache_with(resolver.clone());

        cache.get("jazz", "a1").await.unwrap();
        cache.shutdown();

        assert!(cache.is_closed());
        assert!(cache.is_empty());
        assert!(matches!(cache.get("jazz", "a1").await, Err(StreamError::ShutDown)));
        assert_eq!(resolver.calls(), 1);
    }
}
