//! Cost Governor (C6)
//!
//! Tracks rolling per-identity spend (10 minute window) and calendar-
//! aligned global spend (hourly, daily), rejecting or throttling once
//! a threshold crosses. Costs are accumulated as integer micro-USD
//! internally — spec.md §4.4 requires at least six-decimal precision,
//! and floating point would drift under repeated small increments.
//!
//! `enable_cost_throttling` gates only the *writing* of new per-
//! identity throttle records (spec.md §8 invariant 5: "if
//! enable_cost_throttling is false, no throttle records are ever
//! written"); the global hourly/daily hard caps in `preflight` are
//! unconditional, since no setting in spec.md §6's table claims to
//! gate them.

use crate::clock::Clock;
use crate::error::{GateError, Rejection};
use crate::kv::KvStore;
use crate::settings::{Settings, DISABLED_SENTINEL};
use std::sync::Arc;

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
const MICROS_PER_USD: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> i64 {
    (usd * MICROS_PER_USD).round() as i64
}

fn utc_hour_bucket(now: i64) -> i64 {
    now / SECONDS_PER_HOUR
}

fn utc_day_bucket(now: i64) -> i64 {
    now / SECONDS_PER_DAY
}

fn seconds_to_hour_boundary(now: i64) -> i64 {
    SECONDS_PER_HOUR - (now % SECONDS_PER_HOUR)
}

fn seconds_to_day_boundary(now: i64) -> i64 {
    SECONDS_PER_DAY - (now % SECONDS_PER_DAY)
}

pub struct CostGovernor {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
}

impl CostGovernor {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: Arc<Settings>) -> Self {
        Self { kv, clock, settings }
    }

    /// `preflight(identity) -> Decision`, called before any expensive
    /// downstream work.
    pub async fn preflight(&self, identity: &str) -> Result<(), GateError> {
        let now = self.clock.now_unix();

        // (a) per-identity throttle record.
        match self.kv.get_expiry(&Self::throttle_key(identity)).await {
            Ok(Some(expires_at)) if expires_at > now => {
                return Err(GateError::cost_throttled(
                    Rejection::new((expires_at - now).max(1), 0).with_ban_expiry(expires_at),
                ));
            }
            Ok(_) => {}
            // Fail-open for recoverable per-identity state (spec.md §4.4).
            Err(e) => tracing::warn!(error = %e, "throttle read failed, failing open"),
        }

        // (b) global hourly spend, (c) global daily spend — fail-safe
        // (deny) on KV outage since these guard an absolute budget.
        let hourly_limit = to_micros(self.settings.get_float("hourly_spend_limit_usd").await?);
        let hourly_spend = self
            .kv
            .get_i64(&Self::hour_key(now))
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;
        if hourly_spend >= hourly_limit {
            return Err(GateError::global_budget_exceeded(Rejection::new(
                seconds_to_hour_boundary(now),
                0,
            )));
        }

        let daily_limit = to_micros(self.settings.get_float("daily_spend_limit_usd").await?);
        let daily_spend = self
            .kv
            .get_i64(&Self::day_key(now))
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;
        if daily_spend >= daily_limit {
            return Err(GateError::global_budget_exceeded(Rejection::new(
                seconds_to_day_boundary(now),
                0,
            )));
        }

        // Optional per-identity daily hard cap (spec.md §6, default off).
        let identity_daily_limit_usd = self.settings.get_float("daily_cost_limit_usd").await?;
        if identity_daily_limit_usd > DISABLED_SENTINEL {
            let identity_daily_spend = self
                .kv
                .get_i64(&Self::identity_day_key(identity, now))
                .await
                .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;
            if identity_daily_spend >= to_micros(identity_daily_limit_usd) {
                return Err(GateError::global_budget_exceeded(Rejection::new(
                    seconds_to_day_boundary(now),
                    0,
                )));
            }
        }

        Ok(())
    }

    /// `record(identity, cost_usd)`, called post-hoc by the accountant.
    /// Always updates the accounting counters (spec.md §8 invariant 4);
    /// only writes a new throttle record when cost throttling is
    /// enabled and the per-identity window crosses its threshold.
    pub async fn record(&self, identity: &str, cost_usd: f64) {
        let now = self.clock.now_unix();
        let micros = to_micros(cost_usd);
        if micros == 0 {
            return;
        }

        let window_secs = match self.settings.get_int("high_cost_window_seconds").await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "settings read failed during cost recording");
                600
            }
        };

        let ten_min_spend = match self
            .kv
            .incr_by_with_ttl(&Self::identity_window_key(identity), micros, window_secs)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to record per-identity spend");
                return;
            }
        };

        if let Err(e) = self
            .kv
            .incr_by_with_ttl(&Self::hour_key(now), micros, seconds_to_hour_boundary(now))
            .await
        {
            tracing::error!(error = %e, "failed to record hourly global spend");
        }

        if let Err(e) = self
            .kv
            .incr_by_with_ttl(&Self::day_key(now), micros, seconds_to_day_boundary(now))
            .await
        {
            tracing::error!(error = %e, "failed to record daily global spend");
        }

        if let Err(e) = self
            .kv
            .incr_by_with_ttl(
                &Self::identity_day_key(identity, now),
                micros,
                seconds_to_day_boundary(now),
            )
            .await
        {
            tracing::error!(error = %e, "failed to record per-identity daily spend");
        }

        let throttling_enabled = self
            .settings
            .get_bool("enable_cost_throttling")
            .await
            .unwrap_or(true);
        if !throttling_enabled {
            return;
        }

        let threshold = to_micros(
            self.settings
                .get_float("high_cost_threshold_usd")
                .await
                .unwrap_or(0.015),
        );

        if ten_min_spend >= threshold {
            let duration = self
                .settings
                .get_int("cost_throttle_duration_seconds")
                .await
                .unwrap_or(30);
            if let Err(e) = self
                .kv
                .set_if_greater(&Self::throttle_key(identity), now + duration, now)
                .await
            {
                tracing::error!(error = %e, "failed to write throttle record");
            }
        }
    }

    fn throttle_key(identity: &str) -> String {
        format!("throttle:{identity}")
    }

    fn identity_window_key(identity: &str) -> String {
        format!("cost:10m:{identity}")
    }

    fn hour_key(now: i64) -> String {
        format!("cost:hour:{}", utc_hour_bucket(now))
    }

    fn day_key(now: i64) -> String {
        format!("cost:day:{}", utc_day_bucket(now))
    }

    fn identity_day_key(identity: &str, now: i64) -> String {
        format!("cost:day:{identity}:{}", utc_day_bucket(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::kv::InMemoryKvStore;
    use crate::settings::SettingValue;
    use std::time::Duration;

    async fn governor_with(
        threshold_usd: f64,
        window_secs: i64,
        throttle_secs: i64,
    ) -> (CostGovernor, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(1_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let settings = Arc::new(Settings::new(kv.clone(), Duration::from_secs(0)));
        settings
            .set("high_cost_threshold_usd", SettingValue::Float(threshold_usd))
            .await
            .unwrap();
        settings
            .set("high_cost_window_seconds", SettingValue::Int(window_secs))
            .await
            .unwrap();
        settings
            .set(
                "cost_throttle_duration_seconds",
                SettingValue::Int(throttle_secs),
            )
            .await
            .unwrap();
        let governor = CostGovernor::new(kv, clock.clone(), settings);
        (governor, clock)
    }

    #[tokio::test]
    async fn s5_per_identity_window_throttles_after_threshold() {
        let (governor, _clock) = governor_with(0.015, 600, 30).await;
        for _ in 0..16 {
            governor.record("addr:i", 0.001).await;
        }
        let err = governor.preflight("addr:i").await.unwrap_err();
        match err {
            GateError::CostThrottled(r) => {
                assert!(r.retry_after_seconds >= 1 && r.retry_after_seconds <= 30);
            }
            other => panic!("expected CostThrottled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn below_threshold_never_throttles() {
        let (governor, _clock) = governor_with(1.0, 600, 30).await;
        for _ in 0..5 {
            governor.record("addr:i", 0.001).await;
        }
        assert!(governor.preflight("addr:i").await.is_ok());
    }

    #[tokio::test]
    async fn disabled_throttling_writes_no_throttle_record() {
        let clock = Arc::new(FixedClock::new(1_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let settings = Arc::new(Settings::new(kv.clone(), Duration::from_secs(0)));
        settings
            .set("enable_cost_throttling", SettingValue::Bool(false))
            .await
            .unwrap();
        settings
            .set("high_cost_threshold_usd", SettingValue::Float(0.001))
            .await
            .unwrap();
        let governor = CostGovernor::new(kv.clone(), clock, settings);
        governor.record("addr:i", 1.0).await;
        assert!(kv.get_expiry("throttle:addr:i").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn s6_global_daily_cap_blocks_until_day_boundary() {
        let (governor, clock) = governor_with(10.0, 600, 30).await;
        let settings_kv: Arc<dyn KvStore> = governor.kv.clone();
        let settings = Settings::new(settings_kv, Duration::from_secs(0));
        settings
            .set("daily_spend_limit_usd", SettingValue::Float(0.01))
            .await
            .unwrap();
        let governor = CostGovernor::new(governor.kv.clone(), clock.clone(), Arc::new(settings));

        governor.record("addr:a", 0.006).await;
        governor.record("addr:b", 0.006).await;

        let err = governor.preflight("addr:c").await.unwrap_err();
        assert!(matches!(err, GateError::GlobalBudgetExceeded(_)));
    }
}
