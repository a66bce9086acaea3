mod broadcast;
mod config;
mod directory;
mod handlers;
mod pairing;
mod protocol;
mod quick_pair;
mod registry;
mod trigger;
mod websocket;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use linecast_core::TokenIssuer;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::broadcast::ChannelBroadcaster;
use crate::config::{Cli, Config};
use crate::directory::InMemoryDirectory;
use crate::handlers::AppState;
use crate::pairing::PairingCoordinator;
use crate::quick_pair::QuickPairService;
use crate::registry::ConnectionRegistry;
use crate::trigger::{TracingAuditLog, TriggerOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::try_from(&cli).context("invalid configuration")?;

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let issuer = TokenIssuer::new(config.token_secret.as_bytes());
    let broadcaster = ChannelBroadcaster::new(config.dedupe_window);
    let pairing = PairingCoordinator::new(
        issuer.clone(),
        config.qr_session_ttl,
        config.channel_token_ttl,
        config.public_url.clone(),
    );
    let sweeper = pairing.spawn_sweeper(config.sweep_interval);

    let state = AppState {
        registry: ConnectionRegistry::new(issuer.clone(), config.auth_deadline),
        broadcaster: broadcaster.clone(),
        pairing,
        quick_pair: QuickPairService::new(issuer, config.quick_pair_ttl, config.public_url.clone()),
        trigger: TriggerOrchestrator::new(
            broadcaster,
            Arc::new(TracingAuditLog),
            config.public_url.clone(),
        ),
        directory: Arc::new(InMemoryDirectory::default()),
    };

    let app = handlers::router(state).route(
        "/metrics",
        get(move || std::future::ready(metrics_handle.render())),
    );

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, public_url = %config.public_url, "linecast relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    info!("linecast relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
