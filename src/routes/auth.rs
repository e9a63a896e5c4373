//! Challenge endpoint (spec.md §6)
//!
//! `GET /auth/challenge` issues a one-time challenge ID, anchored to
//! whatever identity the caller presents (fingerprint header if valid,
//! else network address) purely to rate-limit issuance per spec.md §9 —
//! the anchor is never required to match the fingerprint presented
//! later at admission time.

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;

use super::AppState;
use crate::error::GateError;

const FINGERPRINT_HEADER: &str = "x-fingerprint";

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ChallengeResponse {
    Issued {
        challenge: String,
        ttl_seconds: i64,
    },
    Disabled {
        challenge: &'static str,
    },
}

pub async fn issue_challenge(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, GateError> {
    if !state.settings.get_bool("enable_challenge_response").await? {
        return Ok(Json(ChallengeResponse::Disabled {
            challenge: "disabled",
        }));
    }

    let fingerprint_header = headers
        .get(FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok());

    let anchor = state.identity_resolver.resolve(
        fingerprint_header,
        |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        },
        peer_addr,
    );

    let issued = state.challenge_service.issue(anchor.as_str()).await?;

    Ok(Json(ChallengeResponse::Issued {
        challenge: issued.challenge_id,
        ttl_seconds: issued.ttl_seconds,
    }))
}
