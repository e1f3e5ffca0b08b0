use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{format_duration, Resolver, StreamRecord};
use crate::config::Config;
use crate::error::{ResolutionError, ResolutionFailure};

/// Lifetime YouTube grants a signed play URL when it carries no `expire` parameter.
const VIDEO_LIFESPAN: Duration = Duration::from_secs(60 * 60 * 5);

static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id pattern"));

/// Resolver backed by the `yt-dlp` command line extractor.
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: String,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    /// Present when `-f` selected a single format
    url: Option<String>,
    formats: Option<Vec<Format>>,
}

#[derive(Debug, Deserialize)]
struct Format {
    url: String,
    acodec: Option<String>,
    vcodec: Option<String>,
    abr: Option<f64>,
}

impl Format {
    fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|codec| codec != "none")
    }

    fn is_audio_only(&self) -> bool {
        self.has_audio() && self.vcodec.as_deref().map_or(true, |codec| codec == "none")
    }
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ytdlp_path.clone(), config.ytdlp_timeout)
    }

    /// Verifica que yt-dlp esté disponible y devuelve su versión
    pub async fn verify_available(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Error al ejecutar {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("{} no puede ejecutarse correctamente", self.binary);
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("✅ yt-dlp versión: {}", version);
        Ok(version)
    }

    /// Checks the 11-character YouTube id alphabet
    pub fn is_video_id(video_id: &str) -> bool {
        VIDEO_ID.is_match(video_id)
    }

    pub fn watch_url(video_id: &str) -> String {
        url::Url::parse_with_params("https://www.youtube.com/watch", &[("v", video_id)])
            .map(String::from)
            .unwrap_or_else(|_| format!("https://www.youtube.com/watch?v={video_id}"))
    }

    /// Maps yt-dlp's stderr onto a failure kind.
    fn classify(stderr: &str) -> ResolutionFailure {
        let lower = stderr.to_lowercase();
        if lower.contains("http error 429") || lower.contains("too many requests") {
            ResolutionFailure::RateLimited
        } else if lower.contains("video unavailable")
            || lower.contains("private video")
            || lower.contains("has been removed")
            || lower.contains("is not available")
            || lower.contains("does not exist")
        {
            ResolutionFailure::NotFound
        } else if lower.contains("unable to download")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("name or service not known")
        {
            ResolutionFailure::Network
        } else {
            ResolutionFailure::Extractor
        }
    }

    fn best_audio_url(info: &YtDlpInfo) -> Option<String> {
        if let Some(url) = &info.url {
            return Some(url.clone());
        }

        let formats = info.formats.as_ref()?;
        let by_bitrate = |a: &&Format, b: &&Format| {
            a.abr
                .unwrap_or(0.0)
                .partial_cmp(&b.abr.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        };

        formats
            .iter()
            .filter(|f| f.is_audio_only())
            .max_by(by_bitrate)
            .or_else(|| formats.iter().filter(|f| f.has_audio()).max_by(by_bitrate))
            .map(|f| f.url.clone())
    }

    /// Reads the `expire` query parameter the upstream signs play URLs with.
    fn url_expiry(play_url: &str) -> Option<DateTime<Utc>> {
        let parsed = url::Url::parse(play_url).ok()?;
        let expire = parsed
            .query_pairs()
            .find(|(key, _)| key == "expire")
            .and_then(|(_, value)| value.parse::<i64>().ok())?;
        Utc.timestamp_opt(expire, 0).single()
    }

    fn into_record(
        category: &str,
        info: YtDlpInfo,
        now: DateTime<Utc>,
    ) -> Result<StreamRecord, ResolutionError> {
        let play_url = Self::best_audio_url(&info).ok_or_else(|| {
            ResolutionError::new(
                category,
                info.id.clone(),
                ResolutionFailure::Extractor,
                "No hay formato de audio disponible",
            )
        })?;

        let expiry_timestamp = Self::url_expiry(&play_url).unwrap_or_else(|| {
            now + chrono::Duration::from_std(VIDEO_LIFESPAN).unwrap_or(chrono::Duration::zero())
        });

        let duration = info
            .duration
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default();

        Ok(StreamRecord {
            category: category.to_string(),
            title: info.title,
            author: info.uploader.or(info.channel).unwrap_or_default(),
            video_id: info.id,
            duration: format_duration(duration),
            play_url,
            expiry_timestamp,
        })
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, category: &str, video_id: &str) -> Result<StreamRecord, ResolutionError> {
        if !Self::is_video_id(video_id) {
            return Err(ResolutionError::new(
                category,
                video_id,
                ResolutionFailure::InvalidId,
                "ID de video mal formado",
            ));
        }

        let url = Self::watch_url(video_id);
        debug!("🎵 Obteniendo URL de stream para: {}", url);

        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--dump-json",
            "--no-playlist",
            "--no-warnings",
            "-f",
            "bestaudio/best",
            url.as_str(),
        ])
        .kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ResolutionError::new(
                    category,
                    video_id,
                    ResolutionFailure::Network,
                    format!("Error al ejecutar yt-dlp: {e}"),
                ))
            }
            Err(_) => {
                warn!("⏰ Timeout de yt-dlp para {}", url);
                return Err(ResolutionError::new(
                    category,
                    video_id,
                    ResolutionFailure::Timeout,
                    format!("yt-dlp no respondió en {:?}", self.timeout),
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolutionError::new(
                category,
                video_id,
                Self::classify(&stderr),
                stderr.trim(),
            ));
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout).map_err(|e| {
            ResolutionError::new(
                category,
                video_id,
                ResolutionFailure::Extractor,
                format!("Error al parsear respuesta de yt-dlp: {e}"),
            )
        })?;

        Self::into_record(category, info, Utc::now())
    }

    async fn purge_external_cache(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("--rm-cache-dir")
            .output()
            .await
            .context("Error al ejecutar yt-dlp --rm-cache-dir")?;

        if !output.status.success() {
            anyhow::bail!(
                "yt-dlp --rm-cache-dir falló: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        debug!("🧹 Caché de yt-dlp eliminada");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}
