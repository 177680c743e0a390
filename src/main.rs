//! ==============================================================================
//! main.rs - airgradient hub entry point
//! ==============================================================================
//!
//! purpose:
//!     runs the ingestion endpoint until ctrl-c. AirGradient devices are
//!     configured to push to this host; every accepted reading is echoed to the
//!     log so the hub can be used standalone to watch a fleet.
//!
//! responsibilities:
//!     - load configuration (file, then env overrides)
//!     - set up tracing
//!     - register echo subscribers for discovery and updates
//!     - start the endpoint, wait for ctrl-c, stop it gracefully
//!
//! relationships:
//!     - uses: config.rs (listen address, log level, echo toggle)
//!     - uses: server.rs (IngestServer), dispatcher.rs (state + fan-out)
//!
//! architecture:
//!
//!     device ──POST──▶ server ──▶ validate ──▶ dispatcher ──▶ subscribers
//!                                                  │
//!                                            latest state
//!
//! ==============================================================================

use airgradient_hub::config::HubConfig;
use airgradient_hub::{Dispatcher, IngestServer, SensorData, Snapshot};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let config = HubConfig::load_or_default();

    // step 2: logging (RUST_LOG wins over the config file)
    init_logging(&config.logging.level);
    info!("AirGradient hub v{}", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    // step 3: shared state + echo subscribers
    let dispatcher = Arc::new(Dispatcher::new());
    register_echo(&dispatcher, config.logging.show_sensor_data).await;

    // step 4: serve until ctrl-c
    let server = IngestServer::new(dispatcher.clone());
    server
        .start(&config.server.host, config.server.port)
        .await
        .context("failed to start ingestion endpoint")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    server.stop().await?;
    info!(
        "{} device(s) reported this session",
        dispatcher.device_count().await
    );
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// ==============================================================================
// echo subscribers
// ==============================================================================

async fn register_echo(dispatcher: &Dispatcher, show_sensor_data: bool) {
    let subscribers = dispatcher.subscribers();

    subscribers
        .subscribe_discovery(|data: SensorData| async move {
            info!(
                device = %data.id,
                "new device {} at {}",
                data.id,
                data.source_address.as_deref().unwrap_or("unknown address")
            );
            Ok(())
        })
        .await;

    if !show_sensor_data {
        return;
    }

    subscribers
        .subscribe_updates(|snapshot: Snapshot| async move {
            for (id, reading) in snapshot.iter() {
                let line = reading
                    .measurements()
                    .into_iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(device = %id, "{}", line);
            }
            Ok(())
        })
        .await;
}
