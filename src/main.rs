#![forbid(unsafe_code)]

use anyhow::Result;
use deskshare::capture::CaptureManager;
use deskshare::config::ServerConfig;
use deskshare::desktop::Desktop;
use deskshare::media::WebRtcEngine;
use deskshare::metrics::ServerMetrics;
use deskshare::session::{SessionManager, SessionSettings};
use deskshare::signaling::{register_broadcast_hooks, MessageHandler, SignalingServer};
use deskshare::turn::IceServerProvider;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deskshare=debug,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Deskshare - Starting server");

    let config = ServerConfig::from_env()?;
    info!("Configuration: {:?}", config);

    let metrics = ServerMetrics::new();
    let sessions = Arc::new(SessionManager::new(SessionSettings {
        implicit_hosting: config.implicit_hosting,
        private_mode: config.private_mode,
    }));
    register_broadcast_hooks(&sessions, &metrics);

    let capture = Arc::new(CaptureManager::new(
        &config.video_ids,
        config.screencast_enabled,
        config.broadcast_url.clone(),
    )?);
    capture.attach(&sessions);

    let desktop = Arc::new(Desktop::new(config.screen_size, config.screen_configurations.clone()));
    let engine = Arc::new(WebRtcEngine::new(capture.clone(), config.stun_urls.clone())?);
    info!("WebRTC engine initialized with videos {:?}", config.video_ids);

    if let Some(ref turn) = config.turn {
        info!("TURN configured: {} URL(s), TTL {}s", turn.urls.len(), turn.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }
    let ice = IceServerProvider::new(config.stun_urls.clone(), config.turn.clone());

    let handler = MessageHandler::new(sessions.clone(), engine, ice, desktop, capture, metrics.clone());
    let server = SignalingServer::new(
        handler,
        metrics,
        config.max_connections,
        config.jwt_secret.clone(),
        config.metrics_token.clone(),
    );

    tokio::select! {
        result = server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    sessions.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
