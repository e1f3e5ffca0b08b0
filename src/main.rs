use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use nemo_stream::cache::{StreamCache, TtlGate};
use nemo_stream::catalog::Catalog;
use nemo_stream::config::Config;
use nemo_stream::refresh::RefreshOrchestrator;
use nemo_stream::sources::{StreamRecord, YtDlpResolver};
use nemo_stream::storage::{DeletionSink, HttpDeletionSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nemo_stream=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando nemo-stream v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let resolver = Arc::new(YtDlpResolver::from_config(&config));

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        resolver.verify_available().await?;
        println!("OK");
        return Ok(());
    }

    // Catálogo: cualquier error aquí impide arrancar
    let catalog = Arc::new(Catalog::load(&config.catalog_path)?);

    let cache = Arc::new(StreamCache::new(catalog, resolver, &config));
    let gate = Arc::new(TtlGate::new(config.cache_ttl));
    let sink = HttpDeletionSink::from_config(&config)?
        .map(|sink| Arc::new(sink) as Arc<dyn DeletionSink>);
    let orchestrator = Arc::new(RefreshOrchestrator::new(cache, gate, sink, &config));

    // Volcar una categoría como JSON y salir
    if let Some(category) = category_arg() {
        let results = orchestrator.cache().get_category(&category).await?;
        let records: Vec<StreamRecord> = results
            .into_iter()
            .filter_map(|(key, result)| match result {
                Ok(record) => Some(record),
                Err(e) => {
                    error!("❌ {}: {}", key, e);
                    None
                }
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        orchestrator.shutdown().await;
        return Ok(());
    }

    // Poblar caché y arrancar el vigilante de TTL
    let report = orchestrator.refresh_all().await;
    if !report.failed.is_empty() {
        error!(
            "❌ {} streams no se pudieron resolver al arrancar",
            report.failed.len()
        );
    }
    orchestrator.spawn_watchdog(config.watchdog_interval);

    info!("🚀 Servicio iniciado exitosamente");

    // Manejar shutdown graceful
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");
    orchestrator.shutdown().await;

    Ok(())
}

fn category_arg() -> Option<String> {
    let mut args = std::env::args().skip_while(|arg| arg != "--category");
    args.next()?;
    args.next()
}
