//! # Live Voice Backend - Main Application Entry Point
//!
//! Runs a real-time voice conversation between the local microphone/speaker
//! and a remote conversational audio service, controlled over HTTP.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the HTTP server and the session loop are asynchronous
//! - **threads + channels**: audio devices live on a dedicated session thread,
//!   handlers reach it through channels
//! - **Result<T, E>**: startup errors bubble up through `anyhow`
//! - **static**: a global shutdown flag shared with the signal task
//!
//! ## Application Architecture:
//! - **config**: defaults, config.toml and environment variables
//! - **audio**: codec, capture, playback scheduling, session controller
//! - **transport**: WebSocket link to the live service
//! - **device**: microphone and speaker selection
//! - **state / health / handlers / websocket**: the HTTP and status surface
//! - **error**: session and HTTP error types

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod state;
mod transport;
mod websocket;

use crate::audio::SessionHandle;
use crate::config::AppConfig;
use crate::device::CpalDevices;
use crate::state::AppState;
use crate::transport::WebSocketConnector;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal set by the signal task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Starts the session controller** on its own thread
/// 4. **Configures the HTTP server** with routes and the status socket
/// 5. **Handles graceful shutdown**, ending any running session first
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.live.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; sessions will fail to connect");
    }

    let session = SessionHandle::spawn(CpalDevices, WebSocketConnector)?;
    let app_state = AppState::new(config.clone(), session.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

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
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session))
                    .route("/devices", web::get().to(handlers::list_devices)),
            )
            .route("/ws/session", web::get().to(websocket::session_websocket))
            .route("/health", web::get().to(health::health_check))
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

    // Release the microphone, speaker and connection before exiting
    if let Err(e) = session.stop().await {
        warn!("Session stop on shutdown failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_voice_backend=trace")
/// - If not set, defaults to "live_voice_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM / SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("Failed to install SIGINT handler: {}", e);
                return;
            }
        };

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
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
