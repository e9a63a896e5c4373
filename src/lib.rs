//! Gatekeeper core library
//!
//! Splitting the gating logic into a library crate (with `main.rs` as a
//! thin binary wrapper) lets integration tests build the router and
//! drive it with `tower::ServiceExt::oneshot`/`reqwest` against a real
//! Redis, the same shape the pack's other axum services use to keep
//! handlers testable without a running process.

pub mod accountant;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod kv;
pub mod routes;
pub mod services;
pub mod settings;
pub mod violations;

use std::sync::Arc;
use std::time::Duration;

use accountant::UsageAccountant;
use clock::SystemClock;
use config::Config;
use gate::RequestGate;
use identity::IdentityResolver;
use kv::{KvStore, RedisKvStore};
use routes::AppState;
use services::{ChallengeService, CostGovernor, RateLimiter};
use settings::Settings;

/// Builds the full set of gate services wired to a live Redis instance
/// and returns the `AppState` the router is built from. Shared by
/// `main.rs` and integration tests so both construct the stack
/// identically.
pub async fn build_state(config: &Config) -> Result<AppState, kv::KvError> {
    let kv_timeout = Duration::from_millis(config.kv_timeout_ms);
    let redis_kv = RedisKvStore::connect(&config.redis_url, kv_timeout).await?;
    let kv: Arc<dyn KvStore> = Arc::new(redis_kv);

    let clock = Arc::new(SystemClock);
    let settings = Arc::new(Settings::new(kv.clone(), Duration::from_secs(3)));
    let identity_resolver = Arc::new(IdentityResolver::new(config.trusted_proxy_headers.clone()));
    let challenge_service = Arc::new(ChallengeService::new(
        kv.clone(),
        clock.clone(),
        settings.clone(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), clock.clone(), settings.clone()));
    let cost_governor = Arc::new(CostGovernor::new(kv.clone(), clock.clone(), settings.clone()));
    let gate = Arc::new(RequestGate::new(
        challenge_service.clone(),
        rate_limiter.clone(),
        cost_governor.clone(),
        settings.clone(),
    ));
    let accountant = Arc::new(UsageAccountant::new(cost_governor.clone()));

    Ok(AppState {
        kv,
        clock,
        settings,
        identity_resolver,
        challenge_service,
        rate_limiter,
        cost_governor,
        gate,
        accountant,
        config: Arc::new(config.clone()),
    })
}
