//! HTTP server for the bidding manager.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]).
//! Without `DATABASE_URL` the in-memory store is used; without
//! `GAVEL_PUSH_PROJECT_ID` notifications are only logged.

use std::sync::Arc;

use anyhow::Context;
use gavel::api;
use gavel::config::ServerConfig;
use gavel::notify::{FcmNotifier, LogNotifier, Notifier};
use gavel::storage::{InMemoryStorage, Storage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gavel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = ServerConfig::from_env()?;

    let manager = match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let storage = gavel::storage::PostgresStorage::new(pool);
            storage.migrate().await?;
            tracing::info!("Using PostgreSQL storage");
            build_manager(Arc::new(storage), &config)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            anyhow::bail!("DATABASE_URL is set but gavel was built without the `postgres` feature")
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            build_manager(Arc::new(InMemoryStorage::new()), &config)
        }
    };

    let app = api::router(manager);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn build_manager<S: Storage + 'static>(
    storage: Arc<S>,
    config: &ServerConfig,
) -> api::SharedManager {
    let notifier: Arc<dyn Notifier> = match &config.push {
        Some(push) => {
            tracing::info!(project_id = %push.project_id, "Push notifications enabled");
            Arc::new(FcmNotifier::from_config(push, storage.clone()))
        }
        None => {
            tracing::warn!("Push not configured, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };
    let storage: Arc<dyn Storage> = storage;
    gavel::BiddingManager::new(storage, notifier).with_config(config.bidding.clone())
}
