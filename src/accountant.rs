//! Usage Accountant (C9)
//!
//! Post-hoc hook invoked with realized LLM cost. Must run exactly once
//! per admitted request — on success, on downstream error, and on
//! cancellation — which is why callers are expected to build it into a
//! scope-exit guard rather than calling it only on the happy path.
//! `Admission::mark_recorded` is the guard itself; this module is the
//! thing that runs once the guard has been claimed.

use crate::gate::Admission;
use crate::services::CostGovernor;
use std::sync::Arc;

pub struct UsageAccountant {
    cost_governor: Arc<CostGovernor>,
}

impl UsageAccountant {
    pub fn new(cost_governor: Arc<CostGovernor>) -> Self {
        Self { cost_governor }
    }

    /// `record(identity, cost_usd, tokens_in, tokens_out, cache_hit)`.
    ///
    /// Silently ignores a second call on the same `Admission` (the
    /// idempotence property in spec.md §8) rather than erroring — by the
    /// time a second call could happen the client has already received
    /// its response, so there is nothing useful to surface.
    pub async fn record(
        &self,
        admission: &Admission,
        cost_usd: f64,
        tokens_in: u32,
        tokens_out: u32,
        cache_hit: bool,
    ) {
        if !admission.mark_recorded() {
            tracing::warn!(
                identity = %admission.identity(),
                "accountant.record called more than once for the same admission, ignoring"
            );
            return;
        }

        let identity = admission.identity().as_str();

        if cache_hit {
            tracing::info!(identity, tokens_in, tokens_out, cache_hit, "cache hit, no spend recorded");
            return;
        }

        self.cost_governor.record(identity, cost_usd).await;
        tracing::info!(
            identity,
            cost_usd,
            tokens_in,
            tokens_out,
            cache_hit,
            "usage recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::identity::IdentityToken;
    use crate::kv::{InMemoryKvStore, KvStore};
    use crate::services::{ChallengeService, RateLimiter};
    use crate::settings::Settings;
    use crate::gate::RequestGate;
    use std::time::Duration;

    async fn admitted() -> (Admission, Arc<CostGovernor>) {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(1_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let settings = Arc::new(Settings::new(kv.clone(), Duration::from_secs(0)));
        let challenge = Arc::new(ChallengeService::new(kv.clone(), clock.clone(), settings.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), clock.clone(), settings.clone()));
        let cost_governor = Arc::new(CostGovernor::new(kv.clone(), clock.clone(), settings.clone()));
        let gate = RequestGate::new(challenge, rate_limiter, cost_governor.clone(), settings);
        let admission = gate
            .admit(IdentityToken::for_test_address("9.9.9.9"))
            .await
            .unwrap();
        (admission, cost_governor)
    }

    #[tokio::test]
    async fn records_cost_exactly_once() {
        let (admission, cost_governor) = admitted().await;
        let accountant = UsageAccountant::new(cost_governor.clone());
        accountant.record(&admission, 0.01, 10, 20, false).await;
        accountant.record(&admission, 0.01, 10, 20, false).await;

        assert!(cost_governor.preflight("addr:9.9.9.9").await.is_ok());
    }

    #[tokio::test]
    async fn cache_hit_records_zero_cost() {
        let (admission, cost_governor) = admitted().await;
        let accountant = UsageAccountant::new(cost_governor);
        accountant.record(&admission, 0.5, 10, 20, true).await;
    }
}
