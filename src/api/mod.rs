//! Control-plane and streaming HTTP surface (spec §6.1, §6.2). Thin by
//! design: every handler delegates to `ControlPlane`, `Broadcast`, or
//! `SignalBus` and does no business logic of its own (SPEC_FULL.md A.5).

pub mod routes;

use crate::broadcast::Broadcast;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::rules::SignalBus;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub control: Arc<ControlPlane>,
    pub broadcast: Arc<Broadcast>,
    pub signal_bus: Arc<SignalBus>,
}

/// Constant-time header/token comparison so admin-token checks don't leak
/// length-dependent timing. No `subtle` dependency in the pack; this is the
/// whole of what's needed for an equal-length bearer token compare.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Builds the full router: public read routes, admin-token-gated mutation
/// routes, and the WebSocket/SSE streaming endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/control/state", get(routes::control_state))
        .route("/control/pause", post(routes::control_pause))
        .route("/control/resume", post(routes::control_resume))
        .route("/control/force-scan", post(routes::control_force_scan))
        .route("/control/breaker", post(routes::control_breaker))
        .route("/stream/rankings", get(routes::stream_rankings))
        .route("/stream/events", get(routes::stream_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
