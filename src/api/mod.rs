//! HTTP surface: router assembly and shared state.

pub mod error;
pub mod middleware;
pub mod routes;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::models::Config;
use crate::policy_cache::PolicyCache;
use crate::store::Db;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub policies: Arc<PolicyCache>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/leads", post(routes::submit_lead))
        .route("/api/leads/:id", get(routes::get_lead))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .with_state(state)
}
