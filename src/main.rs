//! LeadGen backend: lead ingestion, routing and webhook delivery.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leadgen_backend::api::{self, AppState};
use leadgen_backend::delivery::{spawn_delivery_workers, ReqwestTransport};
use leadgen_backend::models::Config;
use leadgen_backend::policy_cache::PolicyCache;
use leadgen_backend::seed;
use leadgen_backend::store::Db;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env()?);
    info!(
        port = config.port,
        workers = config.delivery_workers,
        db = %config.database_path,
        "starting leadgen backend"
    );

    let db = Db::open(&config.database_path)?;

    if let Some(seed_path) = &config.seed_path {
        seed::apply_seed_file(&db, seed_path)
            .with_context(|| format!("Failed to apply seed from {}", seed_path))?;
    }

    let transport = Arc::new(ReqwestTransport::new(
        config.webhook_connect_timeout_secs,
        config.webhook_total_timeout_secs,
    )?);
    spawn_delivery_workers(db.clone(), config.clone(), transport);

    let state = AppState {
        db,
        policies: Arc::new(PolicyCache::new(std::time::Duration::from_secs(
            config.policy_cache_ttl_secs,
        ))),
        config: config.clone(),
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leadgen_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
