//! Gatekeeper core API server
//!
//! Entry point for the abuse-prevention and cost-governance core
//! standing between anonymous HTTP clients and the (out-of-scope)
//! chat/RAG backend. The gating stack itself lives in the library
//! crate (`lib.rs`); this binary wires it to a Redis instance, starts
//! the settings invalidation listener, and serves the axum router with
//! request-ID propagation, structured tracing, CORS, and graceful
//! shutdown, in the same shape as the teacher's `main.rs`.

use axum::http::{header, HeaderName, Method};
use gatekeeper_core::{build_state, config::Config};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::Span;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const SETTINGS_INVALIDATE_CHANNEL: &str = "settings:invalidate";

#[tokio::main]
async fn main() {
    let config = Config::load();
    init_tracing(&config.log_format);

    tracing::info!("starting gatekeeper core");

    let app_state = build_state(&config)
        .await
        .expect("failed to connect to Redis");
    tracing::info!("connected to Redis at {}", config.redis_url);

    spawn_settings_invalidation_listener(config.redis_url.clone(), app_state.settings.clone());

    let cors = build_cors_layer(&config.cors_origins);
    let x_request_id = HeaderName::from_static(X_REQUEST_ID);

    let app = gatekeeper_core::routes::api_router(app_state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(PropagateRequestIdLayer::new(x_request_id))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|request: &axum::http::Request<_>| {
                        let request_id = request
                            .headers()
                            .get(X_REQUEST_ID)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| Uuid::parse_str(s).ok())
                            .unwrap_or_else(Uuid::new_v4);

                        tracing::info_span!(
                            "http_request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id = %request_id,
                        )
                    })
                    .on_response(
                        |response: &axum::http::Response<_>, latency: Duration, _span: &Span| {
                            tracing::info!(
                                status = %response.status().as_u16(),
                                latency_ms = %latency.as_millis(),
                                "request completed"
                            );
                        },
                    ),
            )
            .layer(cors),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid host:port combination");
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.shutdown_timeout_secs))
    .await
    .unwrap();

    tracing::info!("server shutdown complete");
}

/// Subscribes to the settings invalidation channel and clears the
/// in-process settings cache whenever any process writes an override,
/// so "no authoritative in-process cache" (spec.md §5) holds even
/// within the cache's short TTL.
fn spawn_settings_invalidation_listener(
    redis_url: String,
    settings: std::sync::Arc<gatekeeper_core::settings::Settings>,
) {
    tokio::spawn(async move {
        loop {
            match redis::Client::open(redis_url.as_str()) {
                Ok(client) => match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(SETTINGS_INVALIDATE_CHANNEL).await {
                            tracing::warn!(error = %e, "failed to subscribe to settings channel");
                        } else {
                            use futures_util::StreamExt;
                            let mut stream = pubsub.on_message();
                            while let Some(_msg) = stream.next().await {
                                settings.invalidate_all().await;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to open pub/sub connection"),
                },
                Err(e) => tracing::warn!(error = %e, "failed to create redis client for pub/sub"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

fn init_tracing(log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    match log_format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_span_events(FmtSpan::CLOSE))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_span_events(FmtSpan::CLOSE))
                .init();
        }
    }
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];
    let headers = [
        header::CONTENT_TYPE,
        header::AUTHORIZATION,
        header::ACCEPT,
        HeaderName::from_static(X_REQUEST_ID),
        HeaderName::from_static("x-fingerprint"),
    ];

    if origins.is_empty() {
        tracing::warn!("no CORS origins configured, allowing any origin");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        let allowed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(allowed_origins)
            .allow_methods(methods)
            .allow_headers(headers)
    }
}

async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!(
        "shutdown signal received, waiting up to {}s for in-flight requests",
        timeout_secs
    );
}
