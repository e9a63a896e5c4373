//! Chat admission endpoint (spec.md §6)
//!
//! The actual LLM call and retrieval are out of scope (spec.md §1); this
//! handler is the thin seam where a real downstream RAG service would
//! be invoked after `admit()` succeeds. It stands in for that call with
//! a fixed stub cost so the accountant path is exercised end to end,
//! and always calls `accountant.record` exactly once — on the stubbed
//! success path here, but structured so a real handler would do the
//! same from a `Drop`/scope-exit guard to cover downstream errors and
//! cancellation (spec.md §4.8).

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::AppState;
use crate::error::GateError;

const FINGERPRINT_HEADER: &str = "x-fingerprint";

/// Stand-in per-request cost for the downstream call this core does not
/// own. A real integration would pass the realized cost the LLM call
/// reports back.
const STUB_COST_USD: f64 = 0.002;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[allow(dead_code)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub status: &'static str,
}

pub async fn admit_chat(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(_request): Json<ChatRequest>,
) -> Result<impl IntoResponse, GateError> {
    let fingerprint_header = headers
        .get(FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok());

    let identity = state.identity_resolver.resolve(
        fingerprint_header,
        |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        },
        peer_addr,
    );

    let admission = state.gate.admit(identity).await?;

    // Out-of-scope downstream work stands in here (spec.md §1 Non-goals).
    let result = Ok::<_, GateError>(Json(ChatResponse { status: "accepted" }));

    state
        .accountant
        .record(&admission, STUB_COST_USD, 0, 0, false)
        .await;

    result
}
