//! Request Gate (C8)
//!
//! Composes the Identity Resolver, Challenge Service, Rate Limiter, and
//! Cost Governor into the single `admit(request) -> Admission|Rejection`
//! call the chat endpoint uses. Each step can short-circuit with a
//! structured rejection; spec.md §4.7 fixes the order (identity ->
//! challenge consumption -> rate -> cost) and §5 requires that order be
//! preserved even though an implementation may batch KV round trips.

use crate::error::GateError;
use crate::identity::IdentityToken;
use crate::services::{ChallengeService, CostGovernor, RateLimiter};
use crate::settings::Settings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Proof that a request was admitted. Carries the resolved identity so
/// the caller's eventual `Accountant::record` call doesn't need to
/// re-resolve it, and a one-shot guard so the accountant can only be
/// invoked once per admission (spec.md §8: "the gate must expose a
/// guard that rejects a second call with the same admission handle").
pub struct Admission {
    identity: IdentityToken,
    recorded: AtomicBool,
}

impl Admission {
    fn new(identity: IdentityToken) -> Self {
        Self {
            identity,
            recorded: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &IdentityToken {
        &self.identity
    }

    /// Flips the guard from unrecorded to recorded. Returns `true` the
    /// first time, `false` on every subsequent call — callers (the
    /// accountant) must treat `false` as "do nothing", not an error,
    /// since cancellation/retry paths may call it more than once.
    pub fn mark_recorded(&self) -> bool {
        self.recorded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub struct RequestGate {
    challenge: Arc<ChallengeService>,
    rate_limiter: Arc<RateLimiter>,
    cost_governor: Arc<CostGovernor>,
    settings: Arc<Settings>,
}

impl RequestGate {
    pub fn new(
        challenge: Arc<ChallengeService>,
        rate_limiter: Arc<RateLimiter>,
        cost_governor: Arc<CostGovernor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            challenge,
            rate_limiter,
            cost_governor,
            settings,
        }
    }

    /// `admit(request) -> Admission | Rejection`, spec.md §4.7 steps 1-5.
    pub async fn admit(&self, identity: IdentityToken) -> Result<Admission, GateError> {
        // Step 2: consume the challenge, if challenge mode is on and this
        // identity is fingerprint-form. The anchor used at issuance need
        // not match this identity (spec.md §9) — consumption only cares
        // that the challenge ID embedded in the fingerprint was actually
        // issued and not yet used.
        if self.settings.get_bool("enable_challenge_response").await? && identity.is_fingerprint() {
            let challenge_id = identity.challenge_id().ok_or_else(GateError::invalid_challenge)?;
            let consumed = self.challenge.consume(challenge_id).await?;
            if !consumed {
                return Err(GateError::invalid_challenge());
            }
        }

        // Step 3: rate limiter.
        self.rate_limiter
            .check_and_increment(identity.as_str())
            .await?;

        // Step 4: cost governor preflight.
        self.cost_governor.preflight(identity.as_str()).await?;

        // Step 5: admit.
        Ok(Admission::new(identity))
    }
}
