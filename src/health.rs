use crate::hardening::CircuitState;
use crate::main_helper::AppState;
use crate::types::HealthSnapshot;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub upstream: String,
    pub circuit: String,
    pub connections: HealthSnapshot,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let upstream_ok = state.relay.router().base_url().is_some();
    if !upstream_ok {
        tracing::error!("Readiness check: analysis API URL is not configured");
    }

    let circuit = state.circuit_breaker.state().await;
    let circuit_ok = circuit != CircuitState::Open;
    if !circuit_ok {
        tracing::warn!("Readiness check: circuit breaker is open");
    }

    let ready = upstream_ok && circuit_ok;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            upstream: if upstream_ok { "configured" } else { "missing" }.to_string(),
            circuit: circuit.as_str().to_string(),
            connections: state.health.snapshot(),
        }),
    )
}
