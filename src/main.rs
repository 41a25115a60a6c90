//! # Media Stream Bridge - Main Application Entry Point
//!
//! Relays live call audio between a telephony media stream and an automation
//! backend. One Actix-web server accepts two kinds of WebSocket connections:
//!
//! - `/caller…`: the call-audio transport, one connection per call leg
//! - `/observer…`: backend observers that watch the traffic and send control
//!   messages back to callers
//!
//! Caller frames are delivered to the backend over a persistent socket when it
//! is up, and over an HTTP callback otherwise.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, TOML file, environment)
//! - **state**: the shared bridge core and its counters
//! - **bridge**: session registry, translation, delivery and fanout
//! - **websocket**: the connection actors for both paths
//! - **health**: the health endpoint
//! - **error**: the bridge error taxonomy

mod bridge;
mod config;
mod error;
mod health;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `.env`, `config.toml` and the environment
/// 2. **Sets up logging** through `tracing`
/// 3. **Builds the bridge core** and starts its background tasks
/// 4. **Runs the HTTP server** until SIGINT or SIGTERM
///
/// Only startup problems (bad configuration, bind failure) end the process
/// with an error. Everything after that is logged and survived.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting media-stream-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        backend = config.bridge.backend_ws_url.as_deref().unwrap_or("-"),
        callback = config.bridge.callback_url.as_deref().unwrap_or("-"),
        secret_required = config.bridge.shared_secret.is_some(),
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    match app_state.backend_supervisor() {
        Some(supervisor) => background.push(supervisor.spawn()),
        None => info!("No backend socket configured, deliveries use the callback only"),
    }
    background.push(spawn_idle_sweeper(app_state.clone()));

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/health", web::get().to(health::health_check))
            .service(web::scope("/caller").default_service(web::to(websocket::caller_socket)))
            .service(web::scope("/observer").default_service(web::to(websocket::observer_socket)))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = wait_for_shutdown() => {
            if let Err(e) = result {
                error!("Signal handling failed: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    for task in background {
        task.abort();
    }

    info!(
        open_sessions = ?app_state.registry.tokens(),
        "Server stopped gracefully"
    );
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls the filter; without it the bridge logs at debug and
/// Actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_stream_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Periodically drop sessions whose caller has gone quiet without closing.
fn spawn_idle_sweeper(state: AppState) -> JoinHandle<()> {
    let idle_timeout = state.config.bridge.session_idle_timeout();
    let mut interval = tokio::time::interval(state.config.bridge.sweep_interval());

    tokio::spawn(async move {
        loop {
            interval.tick().await;
            if state.registry.is_empty() {
                continue;
            }

            let swept = state.registry.sweep_idle(idle_timeout);
            if !swept.is_empty() {
                info!(sessions = ?swept, "Swept idle sessions");
                state.metrics.record_sessions_swept(swept.len());
            } else {
                debug!(live = state.registry.len(), "Idle sweep found nothing");
            }
        }
    })
}

/// Resolve once SIGTERM or SIGINT arrives.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    Ok(())
}
