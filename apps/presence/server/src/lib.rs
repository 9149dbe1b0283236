//! Presence server for TripTeller: tracks which field workers are reporting a
//! live position and fans every update out to the admin dashboards watching.

pub mod config;
pub mod dispatch;
pub mod identity;
pub mod presence;
pub mod reaper;
pub mod server;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use crate::config::ServerConfig;
use crate::identity::ClaimsTokenVerifier;
use crate::presence::{PresenceRegistry, RegistryConfig};
use crate::reaper::Reaper;
use crate::server::AppState;

pub(crate) fn now_ms() -> u64 {
    tripteller_presence_core::now_millis().max(0) as u64
}

/// Serves until ctrl-c, then stops the reaper and releases every connection.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let registry = Arc::new(PresenceRegistry::new(RegistryConfig::from(
        &config.presence,
    )));
    let state = Arc::new(AppState::new(
        registry.clone(),
        Arc::new(ClaimsTokenVerifier),
        &config.presence,
        metrics,
    ));

    let reaper_handle = Reaper::new(
        registry.clone(),
        config.presence.reap_interval,
        config.presence.subject_stale_timeout,
    )
    .spawn();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("tripteller presence listening on {}", config.listen_addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    reaper_handle.abort();
    let teardown = registry.shutdown();
    info!(
        subjects = teardown.subjects,
        observers = teardown.observers,
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
