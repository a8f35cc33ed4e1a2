use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;

mod functions;
mod schema;
mod services;

use functions::{AppState, ExecutorConfig, SchedulerConfig, scheduler};
use services::{
    CredentialCipher, HttpInvokerResolver, InvokerResolver, JobStore, PgJobStore, PgResponseCache,
    ResponseCache,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!().run(&pool).await?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let cache: Arc<dyn ResponseCache> = Arc::new(PgResponseCache::new(pool));
    let cipher = Arc::new(CredentialCipher::from_env()?);
    let resolver: Arc<dyn InvokerResolver> = Arc::new(HttpInvokerResolver);

    let deps = functions::WorkerDeps {
        store: store.clone(),
        cache: cache.clone(),
        cipher: cipher.clone(),
        resolver,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(scheduler::run(
        deps,
        ExecutorConfig::from_env(),
        SchedulerConfig::from_env(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_cache_sweep(cache, shutdown_rx));

    let app = functions::api::router(AppState { store, cipher });
    let addr = std::env::var("VOLLEY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "volley listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    tracing::info!("shut down");
    Ok(())
}
