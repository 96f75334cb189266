//! Axum router wiring for the ops surface.

use axum::{routing::get, Router};

use crate::{app_state::AppState, ops};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(ops::healthz))
        .route("/v1/policy/stats", get(ops::stats))
        .route("/metrics", get(ops::metrics))
        .with_state(state)
}
