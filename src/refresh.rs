//! Bulk population of the stream cache.
//!
//! [`RefreshOrchestrator`] owns everything that touches many keys at once:
//! category and full-catalog refreshes, the TTL-gated "fresh" read path,
//! background warmups and the TTL watchdog, and clearing the secondary
//! store. Bulk work is best effort: a failing id is logged and reported,
//! never allowed to abort the batch.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::{KeyedResult, StreamCache, TtlGate};
use crate::config::Config;
use crate::error::StreamError;
use crate::sources::{StreamKey, StreamRecord};
use crate::storage::DeletionSink;

/// Key that failed during a bulk refresh.
#[derive(Debug, Clone, Serialize)]
pub struct FailedKey {
    pub key: String,
    pub reason: String,
}

/// Outcome of a full refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub resolved: usize,
    pub failed: Vec<FailedKey>,
    pub elapsed_ms: u64,
}

impl RefreshReport {
    pub fn total(&self) -> usize {
        self.resolved + self.failed.len()
    }
}

/// Outcome of clearing the cache and the secondary store.
#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub deleted: usize,
    pub delete_failures: usize,
}

/// Handle to a background warmup. Dropping it does not cancel the work.
#[derive(Debug)]
pub struct WarmHandle {
    inner: JoinHandle<()>,
}

impl WarmHandle {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Waits for the warmup to end; its outcome is not reported.
    pub async fn wait(self) {
        if let Err(e) = self.inner.await {
            error!("Tarea de precarga abortada: {}", e);
        }
    }
}

pub struct RefreshOrchestrator {
    cache: Arc<StreamCache>,
    gate: Arc<TtlGate>,
    sink: Option<Arc<dyn DeletionSink>>,
    refresh_workers: usize,
    purge_workers: usize,
    // Un solo refresco completo a la vez
    refresh_lock: Mutex<()>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl RefreshOrchestrator {
    pub fn new(
        cache: Arc<StreamCache>,
        gate: Arc<TtlGate>,
        sink: Option<Arc<dyn DeletionSink>>,
        config: &Config,
    ) -> Self {
        Self {
            cache,
            gate,
            sink,
            refresh_workers: config.refresh_workers.max(1),
            purge_workers: config.purge_workers.max(1),
            refresh_lock: Mutex::new(()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &Arc<StreamCache> {
        &self.cache
    }

    pub fn gate(&self) -> &Arc<TtlGate> {
        &self.gate
    }

    /// Resolves every id of a category through the cache. Invalidates nothing.
    pub async fn refresh_category(&self, category: &str) -> Result<Vec<KeyedResult>, StreamError> {
        let keys = self.cache.catalog().keys(category)?;
        debug!("🔄 Refrescando categoría {} ({} videos)", category, keys.len());
        Ok(self.cache.get_many_with(keys, self.refresh_workers).await)
    }

    /// Invalidates the cache, refreshes every category and starts a new epoch.
    pub async fn refresh_all(&self) -> RefreshReport {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_all_locked().await
    }

    /// Runs a full refresh if the gate says the cache is stale at `now`.
    ///
    /// Concurrent stale callers wait for a single refresh.
    pub async fn ensure_fresh_at(&self, now: DateTime<Utc>) -> Option<RefreshReport> {
        if !self.gate.is_stale(now) {
            return None;
        }

        let _guard = self.refresh_lock.lock().await;
        // Otro llamador pudo refrescar mientras esperábamos
        if !self.gate.is_stale(now) {
            return None;
        }

        info!("⏰ Caché vencida, refrescando catálogo completo");
        Some(self.refresh_all_locked().await)
    }

    pub async fn ensure_fresh(&self) -> Option<RefreshReport> {
        self.ensure_fresh_at(Utc::now()).await
    }

    /// Gate-checked single lookup.
    pub async fn get_fresh(&self, category: &str, video_id: &str) -> Result<StreamRecord, StreamError> {
        if !self.cache.catalog().contains(category) {
            return Err(self.cache.catalog().invalid_category(category));
        }
        self.ensure_fresh().await;
        self.cache.get(category, video_id).await
    }

    /// Gate-checked category lookup.
    pub async fn category_fresh(&self, category: &str) -> Result<Vec<KeyedResult>, StreamError> {
        if !self.cache.catalog().contains(category) {
            return Err(self.cache.catalog().invalid_category(category));
        }
        self.ensure_fresh().await;
        self.cache.get_category(category).await
    }

    /// Starts resolving one key in the background and returns at once.
    ///
    /// Only the category is checked up front; resolution failures are logged
    /// and dropped.
    pub fn warm_single(&self, category: &str, video_id: &str) -> Result<WarmHandle, StreamError> {
        if self.cache.is_closed() {
            return Err(StreamError::ShutDown);
        }
        if !self.cache.catalog().contains(category) {
            return Err(self.cache.catalog().invalid_category(category));
        }

        let cache = Arc::clone(&self.cache);
        let key = StreamKey::new(category, video_id);
        let inner = self.tasks.spawn(async move {
            match cache.get(&key.category, &key.video_id).await {
                Ok(_) => debug!("🔥 Precarga completada: {}", key),
                Err(e) => debug!("Precarga fallida {}: {}", key, e),
            }
        });

        Ok(WarmHandle { inner })
    }

    /// Populates the whole catalog in the background, `REFRESH_WORKERS` at a time.
    pub fn warm_all(&self) -> Result<WarmHandle, StreamError> {
        if self.cache.is_closed() {
            return Err(StreamError::ShutDown);
        }

        let cache = Arc::clone(&self.cache);
        let workers = self.refresh_workers;
        let inner = self.tasks.spawn(async move {
            let keys: Vec<StreamKey> = cache.catalog().all_keys().collect();
            let total = keys.len();
            let failed = cache
                .get_many_with(keys, workers)
                .await
                .iter()
                .filter(|(_, result)| result.is_err())
                .count();
            info!("🔥 Precarga del catálogo: {}/{} streams listos", total - failed, total);
        });

        Ok(WarmHandle { inner })
    }

    /// Clears the cache and deletes every catalog id from the secondary store.
    pub async fn clear_all(&self) -> ClearReport {
        self.cache.invalidate_all().await;

        let Some(sink) = self.sink.clone() else {
            debug!("Sin sink de borrado configurado");
            return ClearReport {
                deleted: 0,
                delete_failures: 0,
            };
        };

        let ids = self.cache.catalog().all_ids();
        let outcomes: Vec<bool> = stream::iter(ids)
            .map(|id| {
                let sink = Arc::clone(&sink);
                async move {
                    match sink.delete(&id).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("⚠️ No se pudo borrar {} del sink: {}", id, e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.purge_workers)
            .collect()
            .await;

        let deleted = outcomes.iter().filter(|ok| **ok).count();
        let report = ClearReport {
            deleted,
            delete_failures: outcomes.len() - deleted,
        };
        info!(
            "🗑️ Sink limpiado: {} borrados, {} fallos",
            report.deleted, report.delete_failures
        );
        report
    }

    /// Spawns the task that re-checks the gate every `interval`.
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        let token = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "⏱️ Vigilante de TTL activo (cada {})",
                humantime::format_duration(interval)
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Un refresco a medias se abandona al cerrar
                        tokio::select! {
                            _ = token.cancelled() => break,
                            report = this.ensure_fresh() => {
                                if let Some(report) = report {
                                    debug!("Vigilante refrescó {} streams", report.total());
                                }
                            }
                        }
                    }
                }
            }

            debug!("Vigilante de TTL detenido");
        });
    }

    /// Stops the watchdog, waits for outstanding warmups, then closes the cache.
    ///
    /// A watchdog refresh still running is dropped rather than awaited.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.cache.shutdown();
        info!("✅ Orquestador detenido");
    }

    async fn refresh_all_locked(&self) -> RefreshReport {
        let started = Instant::now();
        self.cache.invalidate_all().await;

        let mut resolved = 0;
        let mut failed = Vec::new();

        for category in self.cache.catalog().categories() {
            let results = match self.refresh_category(&category).await {
                Ok(results) => results,
                Err(e) => {
                    error!("Error refrescando {}: {}", category, e);
                    continue;
                }
            };

            for (key, result) in results {
                match result {
                    Ok(_) => resolved += 1,
                    Err(e) => {
                        warn!("⚠️ {} no se pudo refrescar: {}", key, e);
                        failed.push(FailedKey {
                            key: key.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        self.gate.reset(Utc::now());

        let report = RefreshReport {
            resolved,
            failed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "✅ Catálogo refrescado: {}/{} streams en {}ms",
            report.resolved,
            report.total(),
            report.elapsed_ms
        );
        report
    }
}
