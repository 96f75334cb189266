//! linkguard policy service.
//!
//! Loads the policy config, builds the engine with the local identity
//! authority, and serves the ops endpoints (`/healthz`, `/v1/policy/stats`,
//! `/metrics`). The router embeds the engine through the library crate.

use std::net::SocketAddr;
use tracing_subscriber::{fmt, EnvFilter};

use linkguard_policy::{app_state, config, router};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "linkguard.yaml".to_string());
    let cfg = config::load_from_file(&path).expect("config load failed");
    let listen: SocketAddr = cfg
        .ops
        .listen
        .parse()
        .expect("ops.listen must be a valid SocketAddr");

    let state = app_state::AppState::new(cfg).expect("policy state build failed");
    let app = router::build_router(state);

    tracing::info!(%listen, config = %path, "linkguard-policy starting");
    let listener = tokio::net::TcpListener::bind(listen).await.expect("failed to bind");

    axum::serve(listener, app).await.expect("server failed");
}
