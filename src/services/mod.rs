//! Gate service modules
//!
//! Business logic behind the request-gating core: challenge issuance,
//! rate limiting, and cost governance. Each owns its own KV namespace
//! and is composed by `gate::RequestGate`.

pub mod challenge;
pub mod cost_governor;
pub mod rate_limiter;

pub use challenge::{ChallengeService, IssuedChallenge};
pub use cost_governor::CostGovernor;
pub use rate_limiter::RateLimiter;
