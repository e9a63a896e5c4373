//! Gate error handling
//!
//! A single error type for every way the request gate can refuse or
//! fail a request. Each of the five rejection classes from spec.md §6/
//! §7 carries exactly the fields the HTTP envelope needs; `Internal`
//! covers KV/infra faults and never leaks its message to the client.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// The fields every rejection envelope carries (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct Rejection {
    pub retry_after_seconds: i64,
    pub ban_expires_at: Option<i64>,
    pub violation_count: i64,
}

impl Rejection {
    pub fn new(retry_after_seconds: i64, violation_count: i64) -> Self {
        Self {
            retry_after_seconds,
            ban_expires_at: None,
            violation_count,
        }
    }

    pub fn with_ban_expiry(mut self, expires_at: i64) -> Self {
        self.ban_expires_at = Some(expires_at);
        self
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid or expired challenge")]
    InvalidChallenge(Rejection),

    #[error("rate limit exceeded")]
    RateLimited(Rejection),

    #[error("too many challenge requests")]
    TooManyChallenges(Rejection),

    #[error("spending threshold reached")]
    CostThrottled(Rejection),

    #[error("global budget exceeded")]
    GlobalBudgetExceeded(Rejection),

    #[error("internal fault")]
    Internal(#[from] anyhow::Error),
}

impl GateError {
    pub fn invalid_challenge() -> Self {
        GateError::InvalidChallenge(Rejection::default())
    }

    pub fn rate_limited(rejection: Rejection) -> Self {
        GateError::RateLimited(rejection)
    }

    pub fn too_many_challenges(rejection: Rejection) -> Self {
        GateError::TooManyChallenges(rejection)
    }

    pub fn cost_throttled(rejection: Rejection) -> Self {
        GateError::CostThrottled(rejection)
    }

    pub fn global_budget_exceeded(rejection: Rejection) -> Self {
        GateError::GlobalBudgetExceeded(rejection)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        GateError::Internal(err)
    }

    fn code(&self) -> &'static str {
        match self {
            GateError::InvalidChallenge(_) => "invalid_challenge",
            GateError::RateLimited(_) => "rate_limited",
            GateError::TooManyChallenges(_) => "too_many_challenges",
            GateError::CostThrottled(_) => "cost_throttled",
            GateError::GlobalBudgetExceeded(_) => "global_budget_exceeded",
            GateError::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GateError::InvalidChallenge(_) => StatusCode::FORBIDDEN,
            GateError::RateLimited(_)
            | GateError::TooManyChallenges(_)
            | GateError::CostThrottled(_)
            | GateError::GlobalBudgetExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Bounded, template-derived message — never the raw error text
    /// (spec.md §7).
    fn message(&self) -> &'static str {
        match self {
            GateError::InvalidChallenge(_) => "challenge is invalid, expired, or already used",
            GateError::RateLimited(_) => "too many requests, please slow down",
            GateError::TooManyChallenges(_) => "too many challenge requests, please wait",
            GateError::CostThrottled(_) => "spending threshold reached for this identity",
            GateError::GlobalBudgetExceeded(_) => "service budget exceeded, try again later",
            GateError::Internal(_) => "an internal error occurred",
        }
    }

    fn rejection(&self) -> Rejection {
        match self {
            GateError::InvalidChallenge(r)
            | GateError::RateLimited(r)
            | GateError::TooManyChallenges(r)
            | GateError::CostThrottled(r)
            | GateError::GlobalBudgetExceeded(r) => r.clone(),
            GateError::Internal(_) => Rejection::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Detail {
    error: &'static str,
    message: &'static str,
    retry_after_seconds: i64,
    ban_expires_at: Option<i64>,
    violation_count: i64,
}

#[derive(Debug, Serialize)]
struct EnvelopeBody {
    detail: Detail,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        if let GateError::Internal(ref err) = self {
            tracing::error!(error = %err, "internal gate fault");
        } else {
            tracing::warn!(
                error = self.code(),
                retry_after_seconds = self.rejection().retry_after_seconds,
                violation_count = self.rejection().violation_count,
                "request rejected"
            );
        }

        let status = self.status_code();
        let rejection = self.rejection();
        let body = EnvelopeBody {
            detail: Detail {
                error: self.code(),
                message: self.message(),
                retry_after_seconds: rejection.retry_after_seconds,
                ban_expires_at: rejection.ban_expires_at,
                violation_count: rejection.violation_count,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if rejection.retry_after_seconds > 0 {
            if let Ok(value) = HeaderValue::from_str(&rejection.retry_after_seconds.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
