use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;

/// Secondary store of delivered stream records.
///
/// Cleared alongside the cache: one `delete` per catalog id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeletionSink: Send + Sync {
    async fn delete(&self, video_id: &str) -> Result<()>;
}

/// Sink backed by an HTTP item store: `DELETE {base}/items/{id}`.
pub struct HttpDeletionSink {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpDeletionSink {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("URL del sink mal formada: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("La URL del sink no puede usarse como base: {}", base_url);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        info!("📁 Sink de borrado configurado en: {}", base_url);
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// `None` when no sink URL is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        config
            .deletion_sink_url
            .as_deref()
            .map(|url| Self::new(url, config.deletion_sink_key.clone()))
            .transpose()
    }

    fn item_url(&self, video_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("URL base no válida: {}", self.base_url))?
            .pop_if_empty()
            .push("items")
            .push(video_id);
        Ok(url)
    }
}

#[async_trait]
impl DeletionSink for HttpDeletionSink {
    async fn delete(&self, video_id: &str) -> Result<()> {
        let url = self.item_url(video_id)?;
        let mut request = self.client.delete(url.clone());
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Error al borrar {}", video_id))?;

        match response.status() {
            status if status.is_success() => {
                debug!("🗑️ Registro eliminado: {}", video_id);
                Ok(())
            }
            // Ya no existe: nada que borrar
            StatusCode::NOT_FOUND => Ok(()),
            status => anyhow::bail!("El sink respondió {} al borrar {}", status, video_id),
        }
    }
}
