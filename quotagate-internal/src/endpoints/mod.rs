pub mod completion;
pub mod quota;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::gateway_util::{AppState, AppStateData};

pub const QUOTAGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Assemble the gateway's route table.
pub fn build_router(state: AppStateData) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/v1/chat/completions", post(completion::completion_handler))
        .route("/v1/quota/{identity}", get(quota::quota_status_handler))
        .route("/v1/quota/{identity}/grants", post(quota::grant_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Version and counter metrics, for operators
pub async fn status_handler(State(state): AppState) -> Json<Value> {
    use std::sync::atomic::Ordering;

    let ledger = state.ledger.metrics();
    let selector = state.selector.metrics();
    Json(json!({
        "version": QUOTAGATE_VERSION,
        "ledger": {
            "admitted": ledger.admitted.load(Ordering::Relaxed),
            "rejected": ledger.rejected.load(Ordering::Relaxed),
            "store_errors": ledger.store_errors.load(Ordering::Relaxed),
        },
        "selector": {
            "trips": selector.trips.load(Ordering::Relaxed),
            "holds": selector.holds.load(Ordering::Relaxed),
            "recoveries": selector.recoveries.load(Ordering::Relaxed),
        },
    }))
}
