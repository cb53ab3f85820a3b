//! # STT Gateway - Main Application Entry Point
//!
//! Speech-to-text service: batch jobs, synchronous uploads and live
//! WebSocket streaming, all sharing one Whisper model.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the HTTP side runs on actix's tokio runtime
//! - **OS threads**: job workers block on the queue and the engine, so they
//!   live outside the async runtime
//! - **Arc**: the model manager and job queue are shared by everything
//! - **static**: the shutdown flag lives for the whole program
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **audio**: ffmpeg normalization, voice activity segmentation, streaming sessions
//! - **transcription**: the engine contract, Whisper, and the model manager
//! - **jobs**: the job registry and its worker pool
//! - **handlers** / **websocket** / **health**: the HTTP surface
//! - **error**: pipeline errors and their HTTP responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod jobs;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use jobs::{JobQueue, WorkerPool};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::ModelManager;

/// Set by the signal handlers; polled by [`wait_for_shutdown`].
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. Configuration and logging
/// 2. Model manager, with the model loading in the background
/// 3. Job queue, worker pool and the retention sweep
/// 4. HTTP server, until a shutdown signal arrives
///
/// ## Shutdown:
/// The server stops accepting connections first, then the queue closes and
/// the workers finish whatever job they hold.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting stt-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        model = %config.models.whisper_model,
        device = %config.models.device,
        workers = config.jobs.worker_count,
        "Transcription settings"
    );

    let manager = Arc::new(ModelManager::new(
        config.models.whisper_model.clone(),
        config.models.device.clone(),
    ));
    manager.spawn_load(&config.models);

    let queue = Arc::new(JobQueue::new());
    let app_state = AppState::new(config.clone(), Arc::clone(&manager), Arc::clone(&queue));
    let pool = WorkerPool::start(
        config.jobs.worker_count,
        Arc::clone(&queue),
        Arc::clone(&manager),
        app_state.normalizer.clone(),
    )?;
    spawn_retention_sweep(Arc::clone(&queue), &config);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    setup_signal_handlers()?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/transcribe", web::post().to(handlers::transcribe_file))
                    .route("/transcribe/jobs", web::post().to(handlers::submit_job))
                    .route("/jobs", web::post().to(handlers::submit_job))
                    .route("/jobs/{job_id}", web::get().to(handlers::get_job)),
            )
            .route("/ws/transcribe", web::get().to(websocket::transcribe_websocket))
            .route("/health", web::get().to(health::health_check))
            .route("/ping", web::get().to(health::ping))
            .route("/", web::get().to(health::service_info))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Waiting for job workers to finish");
    if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown()).await {
        error!("Worker pool shutdown failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stt_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically drop finished and failed jobs older than the retention window.
fn spawn_retention_sweep(queue: Arc<JobQueue>, config: &AppConfig) {
    if config.jobs.retention_seconds == 0 {
        info!("Job retention disabled; results are kept until restart");
        return;
    }

    let retention = Duration::from_secs(config.jobs.retention_seconds);
    let mut interval = tokio::time::interval(Duration::from_secs(config.jobs.sweep_interval_seconds));
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            let purged = queue.purge_older_than(retention);
            if purged > 0 {
                info!(purged, "Purged expired jobs");
            }
        }
    });
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`].
fn setup_signal_handlers() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });

    Ok(())
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
