//! # voiceagent-session
//!
//! Runs a live voice conversation with a remote agent service and serves a
//! small HTTP API next to it.
//!
//! ## Application Architecture:
//! - **agent**: the session orchestrator; one task owns every piece of session state
//! - **transport**: the agent socket (handshake, keep-alive, reconnect budget)
//! - **audio**: capture, playback scheduling, level analysers and devices
//! - **conversation**: voice status machine and the conversation log
//! - **credentials**: the credential endpoint and its client
//! - **handlers / health / middleware**: the HTTP surface
//! - **config / state / error**: configuration, shared state and error types

mod agent;
mod audio;
mod config;
mod conversation;
mod credentials;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod state;
mod transport;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use credentials::{Authenticator, HttpAuthenticator, StaticAuthenticator};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voiceagent-session v{}", env!("CARGO_PKG_VERSION"));
    info!(
        agent_url = %config.transport.agent_url,
        auth_url = %config.transport.auth_url,
        "Configuration loaded"
    );

    let microphone = audio::devices::microphone_from_config(&config.audio);
    let speaker = audio::devices::speaker_from_config(&config.audio);
    info!(microphone = %microphone.describe(), "Audio devices ready");

    // without the HTTP server there is no credential endpoint to ask
    let authenticator: Arc<dyn Authenticator> =
        match (config.server.enabled, config.credentials.api_key.clone()) {
            (false, Some(key)) => Arc::new(StaticAuthenticator(key)),
            _ => Arc::new(HttpAuthenticator::new(config.transport.auth_url.clone())),
        };
    let (voice_agent, agent) =
        agent::VoiceAgent::new(config.clone(), microphone, speaker, authenticator);

    setup_signal_handlers();

    let agent_task;
    if config.server.enabled {
        let app_state = AppState::new(config.clone(), agent.clone());
        let bind_addr = format!("{}:{}", config.server.host, config.server.port);
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
                .wrap(middleware::MetricsMiddleware)
                .wrap(middleware::RequestLogging)
                .route("/api/authenticate", web::post().to(handlers::authenticate))
                .service(
                    web::scope("/api/v1")
                        .route("/health", web::get().to(health::health_check))
                        .route("/metrics", web::get().to(health::detailed_metrics))
                        .route("/config", web::get().to(handlers::get_config))
                        .route("/session", web::get().to(handlers::get_session))
                        .route("/session/action", web::post().to(handlers::voice_bot_action))
                        .route("/session/settings", web::put().to(handlers::update_settings))
                        .route("/conversation", web::get().to(handlers::get_conversation)),
                )
                .route("/health", web::get().to(health::health_check))
        })
        .bind(&bind_addr)?
        .run();

        let server_handle = server.handle();
        let server_task = tokio::spawn(server);
        // the listener is bound, so the first credential fetch can reach it
        agent_task = tokio::spawn(voice_agent.run());

        tokio::select! {
            result = server_task => {
                match result {
                    Ok(Err(e)) => error!("Server error: {}", e),
                    Err(e) => error!("Server task error: {}", e),
                    Ok(Ok(())) => {}
                }
            }
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, stopping server...");
                server_handle.stop(true).await;
            }
        }
    } else {
        info!("HTTP server disabled; running the session only");
        agent_task = tokio::spawn(voice_agent.run());
        wait_for_shutdown().await;
    }

    if let Err(e) = agent.send(agent::AgentCommand::Shutdown) {
        warn!("voice agent already stopped: {}", e);
    }
    if let Err(e) = agent_task.await {
        error!("voice agent task failed: {}", e);
    }

    info!("Stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; defaults to
/// `voiceagent_session=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voiceagent_session=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
