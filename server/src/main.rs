//! Iris Coordinator - Main Entry Point
//!
//! Wires the registry, orchestrator, streams and reputation engine
//! together and serves the worker gateway plus the task API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use iris_server::classifier::Classifier;
use iris_server::config::Config;
use iris_server::direct::DirectProcessor;
use iris_server::orchestrator::{spawn_task_janitor, Orchestrator};
use iris_server::registry::{spawn_heartbeat_reaper, NodeRegistry};
use iris_server::reputation::{spawn_reputation_sweeper, ReputationEngine};
use iris_server::stream::{spawn_stream_sweeper, StreamRegistry};
use iris_server::{api, db};

/// Stale streams and terminal tasks are swept on this cadence.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Closed streams nobody drained are kept this long.
const STREAM_GRACE: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iris_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Iris Coordinator"
    );

    // Initialize database
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    // Core services, constructor-injected in dependency order.
    let registry = Arc::new(NodeRegistry::new(
        config.heartbeat_timeout(),
        Duration::from_millis(config.send_grace_ms),
    ));
    let (reputation, reputation_task) = ReputationEngine::start(
        pool.clone(),
        registry.clone(),
        config.reputation_floor,
        config.reputation_ceiling,
        config.weekly_decay_factor,
    )
    .await?;
    let streams = Arc::new(StreamRegistry::new(config.stream_queue_capacity));
    let classifier = Arc::new(Classifier::new(
        config.classifier_url.clone(),
        Duration::from_secs(config.classifier_timeout_s),
    ));
    let direct = Arc::new(DirectProcessor::new(config.direct_processor_url.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        registry.clone(),
        streams.clone(),
        classifier,
        direct,
        reputation.clone(),
        pool.clone(),
    ));

    // Background sweepers.
    let reaper = spawn_heartbeat_reaper(
        registry.clone(),
        Duration::from_secs(config.heartbeat_interval_s),
    );
    let reputation_sweeper = spawn_reputation_sweeper(
        reputation.clone(),
        registry.clone(),
        pool.clone(),
        Duration::from_secs(3600),
    );
    let stream_sweeper = spawn_stream_sweeper(streams.clone(), JANITOR_INTERVAL, STREAM_GRACE);
    let task_janitor = spawn_task_janitor(orchestrator.clone(), JANITOR_INTERVAL);

    // Build application state and router.
    let state = api::AppState::new(
        config.clone(),
        pool,
        registry.clone(),
        streams.clone(),
        orchestrator.clone(),
        reputation.clone(),
    );
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Coordinator listening");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    // Teardown in reverse dependency order:
    // orchestrator, streams, registry, reputation.
    orchestrator.begin_shutdown();
    tokio::time::sleep(Duration::from_millis(500)).await;
    streams.close_all();
    registry.close_all().await;
    reputation.flush().await;

    reaper.abort();
    reputation_sweeper.abort();
    stream_sweeper.abort();
    task_janitor.abort();
    // Everything is flushed; the engine task can stop mid-queue.
    reputation_task.abort();

    info!("Coordinator shutdown complete");

    Ok(())
}
