// Main entry point for the ffrtmp master.

use std::sync::Arc;

use anyhow::{Context, Result};
use master_core::server::{build_app, AppState};
use master_core::{Config, MemoryStore, PgStore, Scheduler, ServiceHost};
use ffrtmp_core::Store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,master_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting ffrtmp master");

    let config = Config::from_env().context("failed to load configuration")?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let store = PgStore::connect(url, config.timeouts.clone())
                .await
                .context("failed to connect to database")?;
            store.migrate().await.context("failed to run migrations")?;
            tracing::info!("database ready");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::with_policy(config.timeouts.clone()))
        }
    };

    let scheduler = Scheduler::new(store.clone(), config.scheduler.clone());
    let state = AppState {
        store,
        metrics: scheduler.metrics(),
        retry: config.scheduler.retry.clone(),
        auth_token: config.auth_token.clone(),
    };
    let app = build_app(state);

    let (assignment, health, cleanup) = scheduler.services();
    let host = ServiceHost::new()
        .with_service(assignment)
        .with_service(health)
        .with_service(cleanup);
    let shutdown = host.token();

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(addr = %addr, "master listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind address")?;

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    host.run_until_shutdown().await?;
    server.await?.context("server error")?;

    Ok(())
}
