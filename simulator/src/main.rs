mod buffer;
mod config;
mod device;
mod errors;
mod household;
mod journal;

use chrono::Utc;
use clap::Parser;
use config::Config;
use device::{BufferedPublisher, Device, DeviceSettings};
use journal::Journal;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wattflow_common::{Broker, BrokerConfig, Publish, Topology};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let specs = config.device_specs();

    info!("Starting meter simulator");
    info!(
        "Broker: {}:{}, exchange: {}, devices: {}",
        config.mqtt_broker,
        config.mqtt_port,
        config.exchange,
        specs.len()
    );

    let shutdown = CancellationToken::new();

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut broker_config = BrokerConfig::new(&config.mqtt_broker, config.mqtt_port, client_id);
    broker_config.exchange = config.exchange.clone();
    broker_config.reconnect_delay = config.reconnect_delay();

    let (broker, connection) =
        match Broker::connect(broker_config, Topology::exchange_only(), &shutdown).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to connect to broker: {}", e);
                std::process::exit(1);
            }
        };

    let settings = DeviceSettings {
        measurement_interval: config.measurement_interval(),
        heartbeat_interval: config.heartbeat_interval(),
        time_step: config.time_step(),
        flush_timeout: config.flush_timeout(),
    };
    let start = Utc::now() + config.start_offset();
    let publisher: Arc<dyn Publish> = Arc::new(broker.clone());
    let ticks = shutdown.child_token();

    let mut devices: Vec<(String, JoinHandle<usize>)> = Vec::with_capacity(specs.len());
    for (device_id, location) in specs {
        let journal = config.journal_dir.as_deref().and_then(|dir| {
            Journal::open(dir, &device_id)
                .map_err(|e| warn!(device_id = %device_id, "Journal disabled: {}", e))
                .ok()
        });
        let device = Device::new(device_id.clone(), location, start, journal);
        let buffered = BufferedPublisher::new(device, publisher.clone(), broker.link(), settings.clone());
        devices.push((device_id, tokio::spawn(buffered.run(ticks.clone()))));
    }

    shutdown_signal().await;
    info!("Received shutdown signal");

    let deadline = Instant::now() + config.shutdown_timeout();

    ticks.cancel();
    let mut lost = 0;
    for (device_id, mut handle) in devices {
        match timeout_at(deadline, &mut handle).await {
            Ok(Ok(remaining)) => lost += remaining,
            Ok(Err(e)) => error!(device_id = %device_id, "Device task failed: {}", e),
            Err(_) => {
                error!(device_id = %device_id, "Device did not stop in time, aborting");
                handle.abort();
            }
        }
    }
    if lost > 0 {
        warn!("{} buffered messages were never published", lost);
    }

    broker.close().await;
    shutdown.cancel();
    if timeout_at(deadline, connection).await.is_err() {
        error!("Broker connection did not close in time");
    }

    info!("Simulator stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
