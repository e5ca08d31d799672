// Main entry point for the loadswarm control server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use swarm_core::plugins::builtin::BuiltinCatalog;
use swarm_core::server::Server;
use swarm_core::store::{ConfigStore, MemoryStore, PostgresStore};
use swarm_core::ServerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,swarm_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting loadswarm control server");

    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    let store: Arc<dyn ConfigStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Running database migrations...");
            PostgresStore::migrate(&pool)
                .await
                .context("Failed to run migrations")?;

            Arc::new(PostgresStore::new(pool))
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set; using the in-memory store (state will not survive restarts)"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let server = Server::start(config, store, &BuiltinCatalog)
        .await
        .context("Failed to start server")?;
    tracing::info!("Server running; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    server.shutdown().await;
    Ok(())
}
