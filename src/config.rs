//! Application configuration
//!
//! Loads configuration from environment variables with sensible defaults.
//! Dynamic policy values (limits, thresholds, toggles) are NOT here — those
//! live in the settings registry (see `settings.rs`) and can change without
//! a restart. This module only covers process-level wiring: where Redis
//! lives, what port to bind, how to format logs.

use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL backing the shared KV store (C1)
    pub redis_url: String,

    /// HTTP server host (default: 0.0.0.0)
    pub host: String,

    /// HTTP server port
    pub port: u16,

    /// CORS allowed origins (comma-separated, default: localhost dev ports)
    pub cors_origins: Vec<String>,

    /// Log format: "json" for structured, "pretty" for human-readable (default: pretty)
    pub log_format: String,

    /// Graceful shutdown timeout in seconds (default: 30)
    pub shutdown_timeout_secs: u64,

    /// Timeout for a single KV round trip, milliseconds (default: 250, per spec §5)
    pub kv_timeout_ms: u64,

    /// Trusted proxy headers to read the client address from, in priority order
    /// (e.g. "x-forwarded-for", "x-real-ip"). Empty means: use the transport
    /// peer address only. See spec.md §9 open question on proxy trust.
    pub trusted_proxy_headers: Vec<String>,

    /// Require a static bearer token on /admin/settings writes.
    /// Full admin authn is out of scope (owned by the external dashboard);
    /// this is defense in depth for a reference deployment.
    pub require_admin_token: bool,

    /// The bearer token value when `require_admin_token` is true.
    pub admin_token: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults for local development if variables are not set.
    pub fn load() -> Self {
        // Load .env file if it exists
        dotenv().ok();

        let cors_origins_str =
            env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let trusted_proxy_headers: Vec<String> = env::var("TRUSTED_PROXY_HEADERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a number"),
            cors_origins,
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .expect("SHUTDOWN_TIMEOUT_SECS must be a number"),
            kv_timeout_ms: env::var("KV_TIMEOUT_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .expect("KV_TIMEOUT_MS must be a number"),
            trusted_proxy_headers,
            require_admin_token: env::var("REQUIRE_ADMIN_TOKEN")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
            admin_token: env::var("ADMIN_TOKEN").unwrap_or_default(),
        }
    }

    /// Creates a default configuration for testing purposes.
    ///
    /// Not `#[cfg(test)]`: external integration test binaries under `tests/`
    /// link this crate as an ordinary dependency, where `cfg(test)` items
    /// defined here are not visible to them.
    pub fn default_for_test() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/15".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: vec!["http://localhost:3000".to_string()],
            log_format: "pretty".to_string(),
            shutdown_timeout_secs: 5,
            kv_timeout_ms: 250,
            trusted_proxy_headers: vec!["x-forwarded-for".to_string()],
            require_admin_token: false,
            admin_token: String::new(),
        }
    }
}
