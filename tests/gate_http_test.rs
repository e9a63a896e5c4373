//! End-to-end HTTP envelope tests against the assembled router.
//!
//! Builds `AppState` directly over an in-memory `KvStore` (rather than
//! `gatekeeper_core::build_state`, which requires a live Redis) so these
//! run without any external service, and drives requests straight
//! through the router with `tower::ServiceExt::oneshot`. Verifies the
//! HTTP contract in spec.md §6: status codes, the `Retry-After` header,
//! and the `detail.*` envelope fields.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
};
use gatekeeper_core::{
    accountant::UsageAccountant,
    clock::{Clock, FixedClock},
    gate::RequestGate,
    identity::IdentityResolver,
    kv::{InMemoryKvStore, KvStore},
    routes::{api_router, AppState},
    services::{ChallengeService, CostGovernor, RateLimiter},
    settings::{SettingValue, Settings},
};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn peer() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 23), 9000))
}

async fn test_state() -> AppState {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(10_000));
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
    let settings = Arc::new(Settings::new(kv.clone(), Duration::from_secs(0)));
    settings
        .set("rate_limit_per_minute", SettingValue::Int(2))
        .await
        .unwrap();

    let identity_resolver = Arc::new(IdentityResolver::new(vec![]));
    let challenge_service = Arc::new(ChallengeService::new(kv.clone(), clock.clone(), settings.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), clock.clone(), settings.clone()));
    let cost_governor = Arc::new(CostGovernor::new(kv.clone(), clock.clone(), settings.clone()));
    let gate = Arc::new(RequestGate::new(
        challenge_service.clone(),
        rate_limiter.clone(),
        cost_governor.clone(),
        settings.clone(),
    ));
    let accountant = Arc::new(UsageAccountant::new(cost_governor.clone()));

    AppState {
        kv,
        clock,
        settings,
        identity_resolver,
        challenge_service,
        rate_limiter,
        cost_governor,
        gate,
        accountant,
        config: Arc::new(gatekeeper_core::config::Config::default_for_test()),
    }
}

fn chat_request() -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri("/api/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":"hi"}"#))
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(peer()));
    req
}

#[tokio::test]
async fn health_is_always_ok() {
    let app = api_router(test_state().await);
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn third_chat_request_in_a_minute_is_rate_limited_with_envelope() {
    let app = api_router(test_state().await);

    for _ in 0..2 {
        let resp = app.clone().oneshot(chat_request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = app.clone().oneshot(chat_request()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["detail"]["error"], "rate_limited");
    assert_eq!(json["detail"]["violation_count"], 1);
}

#[tokio::test]
async fn challenge_endpoint_issues_then_chat_consumes_once() {
    let app = api_router(test_state().await);

    let challenge_req = Request::builder()
        .uri("/auth/challenge")
        .body(Body::empty())
        .map(|mut r: Request<Body>| {
            r.extensions_mut().insert(ConnectInfo(peer()));
            r
        })
        .unwrap();
    let resp = app.clone().oneshot(challenge_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    let challenge_id = json["challenge"].as_str().unwrap().to_string();

    let fp_header = format!("fp:{challenge_id}:{}", "a".repeat(32));
    let mut first = Request::builder()
        .method("POST")
        .uri("/api/v1/chat")
        .header("content-type", "application/json")
        .header("x-fingerprint", fp_header.clone())
        .body(Body::from(r#"{"message":"hi"}"#))
        .unwrap();
    first.extensions_mut().insert(ConnectInfo(peer()));
    let resp = app.clone().oneshot(first).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut second = Request::builder()
        .method("POST")
        .uri("/api/v1/chat")
        .header("content-type", "application/json")
        .header("x-fingerprint", fp_header)
        .body(Body::from(r#"{"message":"hi again"}"#))
        .unwrap();
    second.extensions_mut().insert(ConnectInfo(peer()));
    let resp = app.clone().oneshot(second).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["detail"]["error"], "invalid_challenge");
}

#[tokio::test]
async fn settings_round_trip_through_admin_endpoints() {
    let app = api_router(test_state().await);

    let put_req = Request::builder()
        .method("PUT")
        .uri("/admin/settings")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"rate_limit_per_minute": 7}"#))
        .unwrap();
    let resp = app.clone().oneshot(put_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["applied"]["rate_limit_per_minute"], true);

    let get_req = Request::builder()
        .uri("/admin/settings")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(get_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["settings"]["rate_limit_per_minute"], 7);
    assert_eq!(json["sources"]["rate_limit_per_minute"], "dynamic");
}
