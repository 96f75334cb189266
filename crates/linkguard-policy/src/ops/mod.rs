//! Operational HTTP endpoints.
//!
//! - `/healthz`         : liveness
//! - `/v1/policy/stats` : admission, profile cache and denial counters (JSON)
//! - `/metrics`         : Prometheus text format

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admission::AdmissionSnapshot;
use crate::app_state::AppState;
use crate::profile::DenialSnapshot;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStats {
    pub admission: AdmissionSnapshot,
    pub cached_profiles: usize,
    pub profile_denials: Vec<DenialSnapshot>,
}

pub async fn stats(State(state): State<AppState>) -> Json<PolicyStats> {
    let engine = state.engine();
    Json(PolicyStats {
        admission: engine.admission(),
        cached_profiles: engine.cached_profiles(),
        profile_denials: engine.profile_denials(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let engine = state.engine();
    let body = engine.metrics().render(&engine.metrics_extra());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
