// Main entry point for the orchestrator

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::kernel::store::PgStore;
use orchestrator_core::kernel::Orchestrator;
use orchestrator_core::server::build_app;
use orchestrator_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CasareRPA Orchestrator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire the core and start background tasks
    let store = Arc::new(PgStore::new(pool));
    let port = config.port;
    let orchestrator = Orchestrator::new(store, config);
    orchestrator.start();

    let app = build_app(orchestrator.clone());

    // Start server
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Listening on {}", addr);
    tracing::info!("Worker sessions: ws://localhost:{}/ws/robot", port);
    tracing::info!("Health check: http://localhost:{}/health", port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let shutdown_orchestrator = orchestrator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown_orchestrator.shutdown().await;
        })
        .await
        .context("Server error")?;

    Ok(())
}
