//! vMix tally bridge
//!
//! Watches every configured vMix instance and publishes `ON` to the
//! configured MQTT topic while any of them is recording, streaming, outputting
//! externally or running MultiCorder, and `OFF` otherwise.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vtally_bridge::{Config, FleetAggregator, MqttPublisher, Supervisor};

/// Time given to the MQTT client to flush a DISCONNECT on shutdown.
const MQTT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to TALLY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vMix tally bridge");
    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        topic = %config.target.topic,
        delivery = ?config.target.delivery,
        retain = config.target.retain,
        instance_count = config.endpoints.len(),
        "Configuration loaded"
    );

    // Create shutdown channel for the bus client
    let (bus_shutdown_tx, bus_shutdown_rx) = watch::channel(false);
    let (publisher, event_loop) = MqttPublisher::connect(&config.mqtt_settings(), bus_shutdown_rx);

    let aggregator = Arc::new(FleetAggregator::new(
        Arc::new(publisher.clone()),
        config.target.clone(),
    ));

    let supervisor = Supervisor::start(
        config.endpoints.clone(),
        Arc::clone(&aggregator),
        config.connection,
    )
    .await;

    // Wait for shutdown signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal, running until killed");
            supervisor.wait().await;
            return Ok(());
        }
    }

    supervisor.shutdown().await;

    // Let the event loop flush the DISCONNECT, then stop it regardless
    publisher.disconnect();
    let mut event_loop = event_loop;
    if tokio::time::timeout(MQTT_SHUTDOWN_GRACE, &mut event_loop)
        .await
        .is_err()
    {
        warn!("MQTT event loop did not stop in time");
        bus_shutdown_tx.send_replace(true);
        let _ = event_loop.await;
    }

    info!("Tally bridge shutdown complete");
    Ok(())
}
