use anyhow::{Context, Result};
use photosink::api::{start_api_server, AppState};
use photosink::archive::S3PhotoArchive;
use photosink::config::Config;
use photosink::device_registry::PostgresDeviceRegistry;
use photosink::ingest::{IngestTopics, PhotoIngestor};
use photosink::mqtt_consumer::MqttIngestService;
use photosink::ocr::HttpOcrClient;
use photosink::photo_store::{connect_pool, run_migrations, PostgresPhotoStore};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting photosink"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Shared store pool
    let pool = connect_pool(&config.database)
        .await
        .context("Failed to initialize database pool")?;

    if config.database.run_migrations {
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
    }

    let devices = Arc::new(PostgresDeviceRegistry::new(pool.clone()));
    let photos = Arc::new(PostgresPhotoStore::new(pool));

    let archive = Arc::new(
        S3PhotoArchive::new(&config.s3)
            .await
            .context("Failed to initialize S3 archive")?,
    );

    let ocr = Arc::new(HttpOcrClient::new(&config.ocr).context("Failed to initialize OCR client")?);

    let ingestor = Arc::new(PhotoIngestor::new(
        devices.clone(),
        photos.clone(),
        archive.clone(),
        ocr,
        IngestTopics::from(&config.mqtt),
        config.s3.storage_prefix.clone(),
    ));

    let shutdown = CancellationToken::new();

    let consumer = MqttIngestService::new(config.mqtt.clone(), ingestor, shutdown.clone());
    let commander = Arc::new(consumer.commander());

    // API state
    let api_state = AppState {
        devices,
        photos,
        archive,
        commander,
        storage_prefix: config.s3.storage_prefix.clone(),
        presign_ttl: config.presigned_url_expiry(),
        auth_token: config.api.auth_token.clone(),
    };

    // Spawn MQTT consumer task
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.run().await {
            error!(error = %e, "MQTT consumer error");
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Photosink started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down photosink");

    shutdown.cancel();
    let _ = consumer_handle.await;
    api_handle.abort();

    info!("Photosink stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
