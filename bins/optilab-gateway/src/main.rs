mod classify;
mod config;
mod content;
mod errors;
mod extract;
mod handlers;
mod launcher;
mod metrics;
mod orchestrator;
mod registry;
mod routes;
mod stream;

use config::RuntimeSettings;
use content::ContentClient;
use errors::ErrorTracker;
use launcher::JobLauncher;
use orchestrator::ExecutionTracker;
use redis::aio::ConnectionManager;
use registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState {
    pub settings: Arc<RuntimeSettings>,
    pub redis: ConnectionManager,
    pub registry: ConnectionRegistry,
    pub tracker: ExecutionTracker,
    pub launcher: JobLauncher,
    pub errors: ErrorTracker,
    pub content: ContentClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Optilab gateway booting...");

    let settings = Arc::new(RuntimeSettings::load_default().map_err(|e| {
        error!("Failed to load runtime settings: {}", e);
        e
    })?);

    info!("Namespace: {}", settings.namespace);
    info!("Sandbox image: {}", settings.image);
    info!(
        "Job deadline: {}s (+{}s TTL)",
        settings.active_deadline_secs, settings.ttl_after_finish_secs
    );

    // Connect to Redis
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", redis_url);

    // Connect to the container engine
    let launcher = JobLauncher::new(settings.clone()).map_err(|e| {
        error!("Failed to connect to container engine: {}", e);
        e
    })?;
    info!("Connected to container engine");

    let error_tracker = ErrorTracker::new();
    let state = Arc::new(AppState {
        settings: settings.clone(),
        redis: redis_conn,
        registry: ConnectionRegistry::new(),
        tracker: ExecutionTracker::new(),
        launcher,
        errors: error_tracker.clone(),
        content: ContentClient::new(settings.content_base_url.clone(), error_tracker),
    });

    // Build router
    let app = routes::routes().with_state(state);

    // Start server
    let listener = TcpListener::bind(&settings.bind_addr).await.map_err(|e| {
        error!("Failed to bind to {}: {}", settings.bind_addr, e);
        anyhow::Error::from(e)
    })?;

    info!("Gateway listening on {}", settings.bind_addr);
    info!("Ready to accept executions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to install CTRL+C signal handler: {}", e);
        return;
    }
    warn!("Received shutdown signal, draining connections...");
}
