//! # Voice Relay Backend - Main Application Entry Point
//!
//! Actix-web server bridging a phone carrier's real-time websocket media
//! stream to the speech-service collaborators (transcription, reply
//! generation, synthesis).
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **audio**: μ-law codec, framing, VAD, and utterance buffering
//! - **session**: per-call state machine, diagnostics trace, registry
//! - **collaborators**: speech-service clients behind trait seams
//! - **relay**: the per-call orchestrator
//! - **websocket**: the carrier wire protocol endpoint
//! - **health / handlers / middleware**: the operational HTTP surface

mod audio;
mod collaborators;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use collaborators::http::{HttpReplyGenerator, HttpSynthesizer, HttpTranscriber};
use collaborators::{cache::SynthesisCache, Collaborators};
use config::AppConfig;
use session::registry::SessionRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, carrier audio {} Hz / {} ms frames",
        config.server.host,
        config.server.port,
        config.audio.sample_rate,
        config.audio.frame_duration_ms
    );

    let registry = Arc::new(SessionRegistry::new(config.performance.max_concurrent_sessions));
    let cache = Arc::new(SynthesisCache::new());
    let collaborators = Collaborators {
        transcriber: Arc::new(HttpTranscriber::new(&config.collaborators)?),
        reply_generator: Arc::new(HttpReplyGenerator::new(&config.collaborators)?),
        synthesizer: Arc::new(HttpSynthesizer::new(&config.collaborators)?),
        observers: Vec::new(),
    };

    let app_state = AppState::new(config.clone(), registry.clone(), collaborators, cache);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();
    spawn_stale_session_reaper(registry, config.performance.session_timeout_seconds);

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
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/status", web::get().to(health::service_status))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route(
                        "/sessions/{stream_sid}/trace",
                        web::get().to(handlers::session_trace),
                    )
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/media-stream", web::get().to(websocket::media_stream))
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

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls verbosity; without it the relay logs at debug and
/// actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically evict sessions whose carrier stream went quiet without a
/// `closed` event (half-open sockets, crashed carriers).
fn spawn_stale_session_reaper(registry: Arc<SessionRegistry>, max_idle_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = registry.cleanup_stale(max_idle_seconds);
            if evicted > 0 {
                info!("Reaped {} stale call sessions", evicted);
            }
        }
    });
}

/// Listen for SIGTERM/SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

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

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
