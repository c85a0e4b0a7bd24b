mod aggregation;
mod auth;
mod config;
mod db;
mod errors;
mod hub;
mod ingest;
mod liveness;
mod metrics;
mod model;
mod rest;
mod store;
mod timeseries;
mod validate;
mod ws;

use aggregation::AggregationScheduler;
use auth::{Authorizer, HttpAuthorizer};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use config::Config;
use db::PgStatusStore;
use hub::Hub;
use ingest::ConsumptionIngestor;
use liveness::LivenessTracker;
use std::sync::Arc;
use store::RedisStore;
use timeseries::{InfluxWriter, TimeSeriesSink};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use wattflow_common::broker::{HEARTBEATS_QUEUE, MEASUREMENTS_QUEUE};
use wattflow_common::{Broker, BrokerConfig, Topology};
use ws::WsState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    info!("Starting telemetry ingestor");
    info!("Broker: {}:{}, exchange: {}", config.mqtt_broker, config.mqtt_port, config.exchange);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    // Durable stores first; none of them can be missing at startup.
    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let kv = match RedisStore::connect(&config.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };

    let timeseries: Arc<dyn TimeSeriesSink> = match InfluxWriter::new(
        &config.influx_url,
        config.influx_org.clone(),
        config.influx_bucket.clone(),
        config.influx_token.clone(),
        config.http_client_timeout(),
    ) {
        Ok(writer) => Arc::new(writer),
        Err(e) => {
            error!("Failed to build time-series client: {}", e);
            std::process::exit(1);
        }
    };

    let authorizer: Arc<dyn Authorizer> =
        match HttpAuthorizer::new(config.auth_url.clone(), config.http_client_timeout()) {
            Ok(authorizer) => Arc::new(authorizer),
            Err(e) => {
                error!("Failed to build authorization client: {}", e);
                std::process::exit(1);
            }
        };

    let root = CancellationToken::new();

    // The hub outlives the pipeline so in-flight events still reach sockets.
    let hub_shutdown = root.child_token();
    let (hub, hub_handle) = Hub::new(config.hub_capacity);
    let hub_task = tokio::spawn(hub.run(hub_shutdown.clone()));

    let broker_shutdown = root.child_token();
    let mut broker_config = BrokerConfig::new(&config.mqtt_broker, config.mqtt_port, &config.client_id);
    broker_config.exchange = config.exchange.clone();
    broker_config.reconnect_delay = config.reconnect_delay();
    broker_config.persistent_session = true;

    let (broker, connection) =
        match Broker::connect(broker_config, Topology::telemetry(), &broker_shutdown).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to connect to broker: {}", e);
                std::process::exit(1);
            }
        };

    let (measurements, heartbeats) = match (
        broker.consume(MEASUREMENTS_QUEUE).await,
        broker.consume(HEARTBEATS_QUEUE).await,
    ) {
        (Ok(measurements), Ok(heartbeats)) => (measurements, heartbeats),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to start consuming: {}", e);
            std::process::exit(1);
        }
    };

    let pipeline = root.child_token();
    let ingestor = ConsumptionIngestor::new(timeseries.clone(), kv.clone(), hub_handle.clone());
    let tracker = Arc::new(LivenessTracker::new(
        kv.clone(),
        Arc::new(PgStatusStore::new(pool.clone())),
        timeseries.clone(),
        hub_handle.clone(),
        config.liveness(),
    ));
    let scheduler = AggregationScheduler::new(kv.clone(), hub_handle.clone(), config.aggregation_period());

    let stages: Vec<(&str, JoinHandle<()>)> = vec![
        ("consumption ingestor", tokio::spawn(ingestor.run(measurements, pipeline.clone()))),
        ("heartbeat absorber", tokio::spawn(tracker.clone().run_absorber(heartbeats, pipeline.clone()))),
        ("liveness sweeper", tokio::spawn(tracker.run_sweeper(pipeline.clone()))),
        ("aggregation scheduler", tokio::spawn(scheduler.run(pipeline.clone()))),
    ];

    let ws_state = WsState {
        hub: hub_handle.clone(),
        authorizer,
        keepalive: config.keepalive(),
        shutdown: hub_shutdown.clone(),
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(ws_state)
        .merge(rest::create_router(pool.clone()));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let accepting = root.child_token();
    let server = tokio::spawn({
        let accepting = accepting.clone();
        async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(accepting.cancelled_owned())
                .await
            {
                error!("HTTP server error: {}", e);
            }
        }
    });

    shutdown_signal().await;
    info!("Received shutdown signal");

    // Stop accepting subscribers, drain the pipeline, drop the broker and
    // close live sockets last.
    let deadline = Instant::now() + config.shutdown_timeout();
    let mut stuck = Vec::new();

    accepting.cancel();

    pipeline.cancel();
    for (name, handle) in stages {
        if !wait_stage(name, handle, deadline).await {
            stuck.push(name);
        }
    }

    broker.close().await;
    broker_shutdown.cancel();
    if !wait_stage("broker connection", connection, deadline).await {
        stuck.push("broker connection");
    }

    hub_shutdown.cancel();
    if !wait_stage("subscription hub", hub_task, deadline).await {
        stuck.push("subscription hub");
    }
    if !wait_stage("http server", server, deadline).await {
        stuck.push("http server");
    }

    root.cancel();
    pool.close().await;

    if stuck.is_empty() {
        info!("Ingestor stopped");
    } else {
        error!("Shutdown incomplete, stages that did not stop: {}", stuck.join(", "));
        std::process::exit(1);
    }
}

/// Waits for a stage until the shared deadline, aborting it on timeout.
async fn wait_stage(name: &str, mut handle: JoinHandle<()>, deadline: Instant) -> bool {
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => {
            debug!("{} stopped", name);
            true
        }
        Ok(Err(e)) => {
            error!("{} failed: {}", name, e);
            false
        }
        Err(_) => {
            error!("{} did not stop before the deadline, aborting", name);
            handle.abort();
            false
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health_handler() -> &'static str {
    "ok"
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
