use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Catálogo
    pub catalog_path: PathBuf,

    // Caché
    pub cache_ttl: Duration,
    pub record_expiry_margin: Duration,
    pub watchdog_interval: Duration,

    // Workers
    pub lookup_workers: usize,
    pub refresh_workers: usize,
    pub purge_workers: usize,

    // yt-dlp
    pub ytdlp_path: String,
    pub ytdlp_timeout: Duration,

    // Sink de borrado (opcional)
    pub deletion_sink_url: Option<String>,
    pub deletion_sink_key: Option<String>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().parse()?),
        _ => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            catalog_path: env_or("CATALOG_PATH", defaults.catalog_path)?,

            cache_ttl: Duration::from_secs(env_or(
                "CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            record_expiry_margin: Duration::from_secs(env_or(
                "RECORD_EXPIRY_MARGIN_SECS",
                defaults.record_expiry_margin.as_secs(),
            )?),
            watchdog_interval: Duration::from_secs(env_or(
                "WATCHDOG_INTERVAL_SECS",
                defaults.watchdog_interval.as_secs(),
            )?),

            lookup_workers: env_or("LOOKUP_WORKERS", defaults.lookup_workers)?,
            refresh_workers: env_or("REFRESH_WORKERS", defaults.refresh_workers)?,
            purge_workers: env_or("PURGE_WORKERS", defaults.purge_workers)?,

            ytdlp_path: env_or("YTDLP_PATH", defaults.ytdlp_path)?,
            ytdlp_timeout: Duration::from_secs(env_or(
                "YTDLP_TIMEOUT_SECS",
                defaults.ytdlp_timeout.as_secs(),
            )?),

            deletion_sink_url: env_opt("DELETION_SINK_URL"),
            deletion_sink_key: env_opt("DELETION_SINK_KEY"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - TTL, watchdog interval and extractor timeout must be non-zero
    /// - Every worker pool width must be > 0
    /// - The per-record expiry margin must be shorter than the TTL
    /// - The deletion sink URL, when set, must parse
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl.is_zero() {
            anyhow::bail!("Cache TTL must be greater than 0");
        }

        if self.record_expiry_margin >= self.cache_ttl {
            anyhow::bail!(
                "Record expiry margin ({}s) must be shorter than the cache TTL ({}s)",
                self.record_expiry_margin.as_secs(),
                self.cache_ttl.as_secs()
            );
        }

        if self.watchdog_interval.is_zero() {
            anyhow::bail!("Watchdog interval must be greater than 0");
        }

        if self.lookup_workers == 0 || self.refresh_workers == 0 || self.purge_workers == 0 {
            anyhow::bail!(
                "Worker pool widths must be greater than 0 (lookup={}, refresh={}, purge={})",
                self.lookup_workers,
                self.refresh_workers,
                self.purge_workers
            );
        }

        if self.ytdlp_timeout.is_zero() {
            anyhow::bail!("yt-dlp timeout must be greater than 0");
        }

        if let Some(url) = &self.deletion_sink_url {
            url::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("Invalid DELETION_SINK_URL {}: {}", url, e))?;
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The deletion sink key is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Catalog: {}\n  \
            Cache: TTL {}, record margin {}, watchdog every {}\n  \
            Workers: lookup {}, refresh {}, purge {}\n  \
            Extractor: {} (timeout {})\n  \
            Deletion sink: {}",
            self.catalog_path.display(),
            humantime::format_duration(self.cache_ttl),
            humantime::format_duration(self.record_expiry_margin),
            humantime::format_duration(self.watchdog_interval),
            self.lookup_workers,
            self.refresh_workers,
            self.purge_workers,
            self.ytdlp_path,
            humantime::format_duration(self.ytdlp_timeout),
            self.deletion_sink_url.as_deref().unwrap_or("disabled"),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_path: "data/streams.json".into(),

            // 4.5h: below the 5h lifetime of a signed play URL
            cache_ttl: Duration::from_secs(16200),
            record_expiry_margin: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(60),

            lookup_workers: 10,
            refresh_workers: 5,
            purge_workers: 10,

            ytdlp_path: "yt-dlp".to_string(),
            ytdlp_timeout: Duration::from_secs(30),

            deletion_sink_url: None,
            deletion_sink_key: None,
        }
    }
}
