//! Rate Limiter (C5)
//!
//! Fixed-window counters on two resolutions (60 s, 3600 s), checked
//! per identity then globally, with a progressive ban ladder on
//! identity-scoped breaches. Follows the five-step sequential
//! algorithm in spec.md §4.3 literally: ban check, per-minute
//! identity, per-hour identity, global per-minute, global per-hour.
//! Because each step short-circuits on the first breach, the
//! "most specific reason wins" tie-break (spec.md §4.3) falls out of
//! the check order rather than needing an explicit comparison.

use crate::clock::Clock;
use crate::error::{GateError, Rejection};
use crate::kv::KvStore;
use crate::settings::Settings;
use crate::violations;
use std::sync::Arc;

/// Ladder for ordinary rate-limit bans (spec.md §4.3 example values).
const RATE_BAN_LADDER: [i64; 4] = [60, 300, 900, 3600];

/// The one endpoint this core gates. Kept as a constant rather than a
/// parameter since the spec describes a single chat admission path;
/// see spec.md §3's `(scope, identity, window)` triple.
pub const ENDPOINT_SCOPE: &str = "chat";

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: Arc<Settings>) -> Self {
        Self { kv, clock, settings }
    }

    pub async fn check_and_increment(&self, identity: &str) -> Result<(), GateError> {
        // Step 1: ban check.
        if let Some((retry_after, ban_expires_at)) = violations::check_ban(
            self.kv.as_ref(),
            self.clock.as_ref(),
            ENDPOINT_SCOPE,
            identity,
        )
        .await
        .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?
        {
            let violation_count = self
                .kv
                .get_i64(&format!("rl:viol:{ENDPOINT_SCOPE}:{identity}"))
                .await
                .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;
            return Err(GateError::rate_limited(
                Rejection::new(retry_after, violation_count).with_ban_expiry(ban_expires_at),
            ));
        }

        // Step 2: per-minute identity counter.
        let per_minute_limit = self.settings.get_int("rate_limit_per_minute").await?;
        self.check_identity_window(identity, 60, per_minute_limit)
            .await?;

        // Step 3: per-hour identity counter.
        let per_hour_limit = self.settings.get_int("rate_limit_per_hour").await?;
        self.check_identity_window(identity, 3600, per_hour_limit)
            .await?;

        // Step 4: global counters, only if enabled.
        if self.settings.get_bool("enable_global_rate_limit").await? {
            let global_minute_limit =
                self.settings.get_int("global_rate_limit_per_minute").await?;
            self.check_global_window(60, global_minute_limit).await?;

            let global_hour_limit = self.settings.get_int("global_rate_limit_per_hour").await?;
            self.check_global_window(3600, global_hour_limit).await?;
        }

        Ok(())
    }

    async fn check_identity_window(
        &self,
        identity: &str,
        window_secs: i64,
        limit: i64,
    ) -> Result<(), GateError> {
        let key = format!("rl:{ENDPOINT_SCOPE}:{identity}:{window_secs}");
        let count = self
            .kv
            .incr_with_ttl(&key, window_secs)
            .await
            .map_err(|_| self.fail_closed_identity_breach())?;

        if count > limit {
            let outcome = violations::record_breach(
                self.kv.as_ref(),
                self.clock.as_ref(),
                ENDPOINT_SCOPE,
                identity,
                &RATE_BAN_LADDER,
            )
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

            return Err(GateError::rate_limited(
                Rejection::new(outcome.retry_after_seconds, outcome.violation_count)
                    .with_ban_expiry(outcome.ban_expires_at),
            ));
        }

        Ok(())
    }

    async fn check_global_window(&self, window_secs: i64, limit: i64) -> Result<(), GateError> {
        let key = format!("rl:global:{window_secs}");
        let count = self
            .kv
            .incr_with_ttl(&key, window_secs)
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

        if count > limit {
            // No ban ladder for global breaches (spec.md §4.3 step 4).
            return Err(GateError::rate_limited(Rejection::new(window_secs, 0)));
        }

        Ok(())
    }

    /// A KV timeout during a counter increment must deny — the system
    /// cannot confirm the limit was respected (spec.md §5).
    fn fail_closed_identity_breach(&self) -> GateError {
        GateError::rate_limited(Rejection::new(60, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::kv::InMemoryKvStore;
    use crate::settings::SettingValue;
    use std::time::Duration;

    async fn limiter_with_minute_limit(limit: i64) -> (RateLimiter, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(1_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let settings = Arc::new(Settings::new(kv.clone(), Duration::from_secs(0)));
        settings
            .set("rate_limit_per_minute", SettingValue::Int(limit))
            .await
            .unwrap();
        let limiter = RateLimiter::new(kv, clock.clone(), settings);
        (limiter, clock)
    }

    #[tokio::test]
    async fn s1_third_admission_under_limit_fourth_rejects_with_ban() {
        let (limiter, _clock) = limiter_with_minute_limit(3).await;
        for _ in 0..3 {
            assert!(limiter.check_and_increment("addr:1.1.1.1").await.is_ok());
        }
        let err = limiter
            .check_and_increment("addr:1.1.1.1")
            .await
            .unwrap_err();
        match err {
            GateError::RateLimited(r) => {
                assert_eq!(r.violation_count, 1);
                assert!(r.retry_after_seconds >= 1 && r.retry_after_seconds <= 60);
                assert_eq!(r.ban_expires_at, Some(1_060));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn s2_ladder_escalates_after_ban_clears() {
        let (limiter, clock) = limiter_with_minute_limit(3).await;
        for _ in 0..4 {
            let _ = limiter.check_and_increment("addr:2.2.2.2").await;
        }
        clock.advance(61);
        for _ in 0..3 {
            assert!(limiter.check_and_increment("addr:2.2.2.2").await.is_ok());
        }
        let err = limiter
            .check_and_increment("addr:2.2.2.2")
            .await
            .unwrap_err();
        match err {
            GateError::RateLimited(r) => {
                assert_eq!(r.violation_count, 2);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn distinct_identities_do_not_share_counters() {
        let (limiter, _clock) = limiter_with_minute_limit(1).await;
        assert!(limiter.check_and_increment("addr:a").await.is_ok());
        assert!(limiter.check_and_increment("addr:b").await.is_ok());
    }
}
