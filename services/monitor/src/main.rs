//! Watchpost camera monitor.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{RUN_MODE}.toml)
//! 2. Environment variables (prefixed with WATCHPOST_, `__` between sections)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watchpost_monitor::config::{DatabaseConfig, LoggingConfig};
use watchpost_monitor::server::{self, AppState, ConnectionSettings};
use watchpost_monitor::{
    worker_detectors, BroadcastHub, CameraDirectory, Detector, Dispatcher, FrameBuffer,
    FrameDiffDetector, MonitorConfig, SqliteStore, Storage, TaskQueue, UdpIngest, WorkerPool,
    WorkerPoolStats,
};

/// Capacity of each hub inbound channel.
const HUB_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_tracing(&config.logging)?;

    info!(
        service = "watchpost-monitor",
        version = env!("CARGO_PKG_VERSION"),
        "Starting camera monitor"
    );

    config.validate()?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let store = open_storage(&config.database).await?;
    let storage = store.clone().map(|store| store as Arc<dyn Storage>);

    // Transports stop first, the hub and flush loop last
    let ingest_shutdown = CancellationToken::new();
    let core_shutdown = CancellationToken::new();

    let (hub, hub_handle) = BroadcastHub::new(HUB_CHANNEL_CAPACITY);
    let hub_task = tokio::spawn(hub.run(core_shutdown.clone()));

    let buffer = Arc::new(FrameBuffer::new(&config.buffer, storage));
    let flush_task = tokio::spawn(
        buffer
            .clone()
            .run(config.buffer.flush_interval(), core_shutdown.clone()),
    );

    match &config.detector.model_path {
        Some(path) => info!(model = %path.display(), "Loading object detection model"),
        None => warn!("No object detection model configured, motion frames will not be labeled or stored"),
    }
    let detectors = worker_detectors(&config.detector, config.processing.num_workers)
        .context("Failed to load object detection model")?;

    let (queue, receiver) = TaskQueue::new(config.processing.queue_size);
    let queue = Arc::new(queue);

    let pool = WorkerPool::start(detectors, queue.clone(), receiver, buffer.clone())
        .context("Failed to start worker pool")?;
    let worker_stats = pool.stats_handle();

    let motion_detector: Arc<dyn Detector> = Arc::new(FrameDiffDetector::new(&config.detector));
    let dispatcher = Arc::new(Dispatcher::new(
        &config.processing,
        motion_detector,
        hub_handle.clone(),
        queue.clone(),
    ));

    let udp_task = if config.udp.enabled {
        let cameras = config.camera_entries();
        for camera in &cameras {
            info!(address = %camera.address, name = %camera.name, "Configured camera");
        }

        let ingest = UdpIngest::bind(&config.udp, CameraDirectory::new(&cameras), dispatcher.clone())
            .await
            .with_context(|| format!("Failed to bind UDP listener on {}", config.udp.bind_address))?;
        Some(tokio::spawn(ingest.run(ingest_shutdown.clone())))
    } else {
        info!("UDP ingest disabled");
        None
    };

    let state = Arc::new(AppState {
        dispatcher: dispatcher.clone(),
        hub: hub_handle.clone(),
        buffer: buffer.clone(),
        worker_stats: worker_stats.clone(),
        storage: store.clone(),
        settings: ConnectionSettings::from(&config.server),
        shutdown: ingest_shutdown.clone(),
        started_at: Instant::now(),
    });

    let listener = server::bind(&config.server.bind_address).await?;
    let mut server_task = tokio::spawn(server::serve(listener, state));

    info!(
        workers = pool.size(),
        queue_size = config.processing.queue_size,
        process_every_nth = dispatcher.processing_interval(),
        flush_interval_secs = config.buffer.flush_interval_secs,
        "Camera monitor running"
    );

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => warn!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }
    }

    // Stop accepting frames
    ingest_shutdown.cancel();
    if let Some(task) = udp_task {
        let _ = task.await;
    }
    if !server_task.is_finished() {
        let _ = server_task.await;
    }

    // Drain queued detection work
    if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown()).await {
        error!(error = %e, "Worker pool shutdown failed");
    }

    core_shutdown.cancel();
    let _ = flush_task.await;

    let report = buffer.flush().await;
    info!(saved = report.saved, failed = report.failed, "Final flush completed");

    let _ = hub_task.await;

    if let Some(store) = &store {
        store.close().await;
    }

    log_final_stats(&dispatcher, &worker_stats.read(), &buffer);

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration.
fn load_config() -> Result<MonitorConfig> {
    // Try loading from files first, fall back to environment
    let config = MonitorConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        MonitorConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("watchpost_monitor={}", level).parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("sqlx=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter.
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Open the metadata database if one is configured.
async fn open_storage(config: &DatabaseConfig) -> Result<Option<Arc<SqliteStore>>> {
    let Some(url) = config.url.as_deref().filter(|url| !url.is_empty()) else {
        info!("No database configured, flushed frames are only written to disk");
        return Ok(None);
    };

    let store = SqliteStore::new(url, config)
        .await
        .context("Failed to open image database")?;

    if config.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Some(Arc::new(store)))
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

/// Log final statistics on shutdown.
fn log_final_stats(dispatcher: &Dispatcher, workers: &WorkerPoolStats, buffer: &FrameBuffer) {
    info!("=== Final Statistics ===");

    let stats = dispatcher.stats();
    info!(
        frames_received = stats.frames_received,
        frames_broadcast = stats.frames_broadcast,
        frames_motion = stats.frames_motion,
        frames_queued = stats.frames_queued,
        frames_dropped = stats.frames_dropped_queue_full,
        motion_errors = stats.motion_errors,
        "Dispatcher final stats"
    );

    info!(
        tasks_processed = workers.tasks_processed,
        frames_with_detections = workers.frames_with_detections,
        detector_errors = workers.detector_errors,
        annotation_fallbacks = workers.annotation_fallbacks,
        "Worker pool final stats"
    );

    let stats = buffer.stats();
    info!(
        saved = stats.saved,
        failed = stats.failed,
        dropped_cap = stats.dropped_cap,
        flushes = stats.flushes,
        "Frame buffer final stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_storage_without_url() {
        let config = DatabaseConfig {
            url: Some(String::new()),
            max_connections: 1,
            run_migrations: true,
        };
        assert!(open_storage(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_storage_creates_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data").join("images.db");
        let config = DatabaseConfig {
            url: Some(format!("sqlite://{}", path.display())),
            max_connections: 1,
            run_migrations: true,
        };

        let store = open_storage(&config).await.unwrap().unwrap();
        assert_eq!(store.stats().await.unwrap().total_images, 0);
        assert!(path.exists());
        store.close().await;
    }
}
