//! Health check routes
//!
//! `/health` reports process liveness unconditionally. `/ready` reports
//! whether the shared KV store is actually reachable, since every
//! admission decision depends on it (SPEC_FULL.md §6).

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub kv_store: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// GET /health - always 200, process liveness only.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

/// GET /ready - 200 only if the KV store answers within its timeout.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.kv.exists("health:ready-probe").await {
        Ok(_) => {
            let body = ReadyResponse {
                ready: true,
                kv_store: "connected",
                timestamp: Utc::now(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            let body = ReadyResponse {
                ready: false,
                kv_store: "unreachable",
                timestamp: Utc::now(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}
