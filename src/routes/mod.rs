//! Route modules and router assembly (C10, SPEC_FULL.md §4.9)
//!
//! Binds the gating core (C3-C9) to axum. Route structure:
//! - `/health`, `/ready` - liveness/readiness at root level
//! - `/auth/challenge` - challenge issuance
//! - `/api/v1/chat` - the gated chat admission endpoint
//! - `/admin/settings` - dynamic settings registry surface

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::accountant::UsageAccountant;
use crate::clock::Clock;
use crate::config::Config;
use crate::gate::RequestGate;
use crate::identity::IdentityResolver;
use crate::kv::KvStore;
use crate::services::{ChallengeService, CostGovernor, RateLimiter};
use crate::settings::Settings;

pub mod admin;
pub mod auth;
pub mod chat;
pub mod health;

/// Shared application state handed to every handler. Every field is an
/// `Arc` over a trait object or a `Send + Sync` service, so cloning
/// `AppState` (axum clones it per-request via `with_state`) is cheap.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<Settings>,
    pub identity_resolver: Arc<IdentityResolver>,
    pub challenge_service: Arc<ChallengeService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cost_governor: Arc<CostGovernor>,
    pub gate: Arc<RequestGate>,
    pub accountant: Arc<UsageAccountant>,
    pub config: Arc<Config>,
}

pub fn api_router(state: AppState) -> Router {
    let v1_router = Router::new().route("/chat", post(chat::admit_chat));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/auth/challenge", get(auth::issue_challenge))
        .route(
            "/admin/settings",
            get(admin::get_settings).put(admin::put_settings),
        )
        .nest("/api/v1", v1_router)
        .with_state(state)
}
