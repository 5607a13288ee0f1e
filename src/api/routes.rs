//! Handlers for the control API (spec §6.1) and streaming endpoints (spec
//! §6.2). Response shapes for the control routes are taken verbatim from
//! `routers/control.py` (`{paused: bool}`, `{queued, reason}`, breaker
//! snapshot, `{paused, breaker, audit[last 20]}`).

use super::{constant_time_eq, AppState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::warn;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const AUDIT_TAIL: usize = 20;

fn admin_authorized(headers: &HeaderMap, state: &AppState) -> bool {
    let Some(header) = headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    constant_time_eq(header, &state.config.admin_api_token)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "missing or invalid admin token"}))).into_response()
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.control.get_health_report())
}

pub async fn control_state(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.control.get_health_report();
    let mut audit = state.control.audit_log();
    if audit.len() > AUDIT_TAIL {
        audit = audit.split_off(audit.len() - AUDIT_TAIL);
    }
    Json(serde_json::json!({
        "paused": report.control.paused,
        "breaker": report.control.breaker,
        "audit": audit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActorReason {
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default)]
    pub reason: String,
}

fn default_actor() -> String {
    "api".to_string()
}

#[derive(Debug, Serialize)]
pub struct PausedResponse {
    pub paused: bool,
}

pub async fn control_pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ActorReason>>,
) -> Response {
    if !admin_authorized(&headers, &state) {
        return unauthorized();
    }
    let ActorReason { actor, reason } = body.map(|Json(b)| b).unwrap_or(ActorReason { actor: default_actor(), reason: String::new() });
    state.control.pause(&actor, &reason);
    Json(PausedResponse { paused: true }).into_response()
}

pub async fn control_resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ActorReason>>,
) -> Response {
    if !admin_authorized(&headers, &state) {
        return unauthorized();
    }
    let ActorReason { actor, reason } = body.map(|Json(b)| b).unwrap_or(ActorReason { actor: default_actor(), reason: String::new() });
    state.control.resume(&actor, &reason);
    Json(PausedResponse { paused: false }).into_response()
}

pub async fn control_force_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ActorReason>>,
) -> Response {
    if !admin_authorized(&headers, &state) {
        return unauthorized();
    }
    let ActorReason { actor, reason } = body.map(|Json(b)| b).unwrap_or(ActorReason { actor: default_actor(), reason: String::new() });
    let result = state.control.force_scan(&actor, &reason);
    if result.queued {
        Json(result).into_response()
    } else {
        (StatusCode::CONFLICT, Json(result)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct BreakerRequest {
    pub state: String,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn control_breaker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BreakerRequest>,
) -> Response {
    if !admin_authorized(&headers, &state) {
        return unauthorized();
    }
    let breaker_state = match body.state.as_str() {
        "open" => crate::control::ManualBreakerState::Open,
        "closed" => crate::control::ManualBreakerState::Closed,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("unknown breaker state '{other}'")})),
            )
                .into_response();
        }
    };
    state.control.set_manual_breaker(breaker_state, &body.actor, &body.reason);
    Json(state.control.get_health_report().control.breaker).into_response()
}

/// WebSocket channel `rankings` (spec §6.2): one `RankingFrame` as JSON text
/// per message, no framing beyond the WebSocket text frame.
pub async fn stream_rankings(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| rankings_socket(socket, state))
}

async fn rankings_socket(mut socket: WebSocket, state: AppState) {
    let sub = state.broadcast.subscribe();
    loop {
        let frame = sub.recv().await;
        let payload = match serde_json::to_string(&*frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize ranking frame for websocket");
                continue;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            return;
        }
    }
}

/// Server-sent events channel `events` (spec §6.2): `data: <json>\n\n` per
/// ranking frame, the SSE-transport twin of the `rankings` WebSocket.
pub async fn stream_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = state.broadcast.subscribe();
    let stream = futures_util::stream::unfold(sub, |sub| async move {
        let frame = sub.recv().await;
        let event = match serde_json::to_string(&*frame) {
            Ok(json) => Event::default().data(json),
            Err(err) => {
                warn!(error = %err, "failed to serialize ranking frame for sse");
                Event::default().data("{}")
            }
        };
        Some((Ok(event), sub))
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("short", "muchlonger"));
    }
}
