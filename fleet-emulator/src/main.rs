//! Fleet Emulator - headless runner
//!
//! Loads the configuration, starts the registry reconciler and prints fleet
//! events to the console until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fleet_emulator::client::build_http_client;
use fleet_emulator::{
    EmulatorConfig, EventHub, FleetEvent, FleetReconciler, HttpRegistryClient, HttpTelemetryClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_emulator=info")),
        )
        .init();

    info!("Starting Fleet Emulator v{}", env!("CARGO_PKG_VERSION"));

    let config = EmulatorConfig::load()
        .await
        .context("Failed to load configuration")?;
    info!(
        "Registry: {} | metrics: {} | collector: {}",
        config.backend.registry_url, config.backend.metrics_base_url, config.backend.collector_base_url
    );

    // One connection pool shared by every agent and the reconciler
    let http = build_http_client(&config.backend).context("Failed to build HTTP client")?;
    let telemetry = Arc::new(HttpTelemetryClient::with_client(http.clone(), config.backend.clone()));
    let registry = Arc::new(HttpRegistryClient::with_client(http, config.backend.clone()));

    let hub = EventHub::new(config.fleet.event_capacity);
    let observer = tokio::spawn(console_observer(hub.clone()));

    let reconciler = FleetReconciler::new(
        registry,
        telemetry,
        config.agent.clone(),
        config.fleet.clone(),
        hub,
    );

    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn(reconciler.run(shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, stopping fleet"),
        Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
    }
    shutdown.cancel();

    if let Err(e) = fleet.await {
        error!("Fleet reconciler task failed: {}", e);
    }
    observer.abort();

    info!("Fleet Emulator stopped");
    Ok(())
}

/// Log every fleet event; stands in for an interactive front-end
async fn console_observer(hub: EventHub) {
    let mut events = hub.subscribe();
    loop {
        match events.recv().await {
            Ok(FleetEvent::Snapshot(s)) => debug!(
                "#{} battery={} metric={} on={} active={} ({:.5}, {:.5})",
                s.device_id, s.battery_level, s.metric_level, s.is_on, s.is_active, s.latitude, s.longitude
            ),
            Ok(FleetEvent::Status { device_id, message }) => info!("#{} {}", device_id, message),
            Ok(FleetEvent::AgentStarted { device_id }) => info!("#{} agent started", device_id),
            Ok(FleetEvent::AgentStopped { device_id }) => info!("#{} agent stopped", device_id),
            Ok(FleetEvent::PollFailed { reason }) => warn!("Registry poll failed: {}", reason),
            Err(RecvError::Lagged(skipped)) => warn!("Console observer lagged, {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
