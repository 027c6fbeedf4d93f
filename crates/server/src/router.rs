use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use chatlog_notify::HubStats;
use chatlog_scheduler::QueueStats;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::live;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>, cors_origin: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(live::ws_upgrade))
        .layer(cors_layer(cors_origin))
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!("Invalid CORS_ORIGIN '{}': {}; allowing any origin", origin, e);
            CorsLayer::permissive()
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub queue: Option<QueueStats>,
    pub hub: Option<HubStats>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queue = state.scheduler.get_queue_stats().await.ok();
    let hub = state.hub.stats().await.ok();
    Json(HealthResponse {
        status: if queue.is_some() { "ok" } else { "stopping" },
        version: env!("CARGO_PKG_VERSION"),
        queue,
        hub,
    })
}
