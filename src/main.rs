mod bridge;
mod config;
mod ha;
mod protocol;
mod sink;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::bridge::Bridge;
use crate::ha::HaClient;
use crate::sink::{BusSink, EventSink, RemoteControlSink};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting qmdev-to-ha bridge (endpoint={}, mode={})",
        config.zmq_sub_endpoint,
        config.mode_name(),
    );

    let ha = match HaClient::new(&config.ha.base_url, &config.ha.token) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to build HA client: {}", e);
            std::process::exit(1);
        }
    };

    let sink: Arc<dyn EventSink> = match &config.mode {
        config::SinkMode::Events => Arc::new(BusSink::new(ha)),
        config::SinkMode::Remote {
            light_entity_id,
            climate_entity_id,
        } => Arc::new(RemoteControlSink::new(
            ha,
            light_entity_id.clone(),
            climate_entity_id.clone(),
        )),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut bridge = Bridge::new(&config.zmq_sub_endpoint, sink);
    let bridge_handle = tokio::spawn(async move {
        bridge.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = async {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate()
            ).expect("Failed to register SIGTERM handler");
            sigterm.recv().await;
        } => {
            info!("Received SIGTERM, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = bridge_handle.await;
    info!("qmdev-to-ha bridge stopped");
}
