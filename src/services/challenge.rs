//! Challenge Service (C4)
//!
//! Issues one-time challenge IDs, tracks the active (unconsumed) set
//! per anchor identity, and validates consumption. The anchor used at
//! issuance time is only ever used to rate-limit issuance — it is not
//! required to match the fingerprint presented later. Requiring a
//! match would let an attacker pin another user's fingerprint to their
//! own anchor (spec.md §9).

use crate::clock::Clock;
use crate::error::{GateError, Rejection};
use crate::kv::KvStore;
use crate::settings::Settings;
use crate::violations;
use std::sync::Arc;
use uuid::Uuid;

/// Short ladder for challenge-spam bans — escalates faster than the
/// rate-limit ladder since legitimate clients never need a second
/// challenge within seconds of the first.
const CHALLENGE_BAN_LADDER: [i64; 4] = [3, 9, 27, 81];

const NAMESPACE: &str = "challenge";

pub struct ChallengeService {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
}

pub struct IssuedChallenge {
    pub challenge_id: String,
    pub ttl_seconds: i64,
}

impl ChallengeService {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: Arc<Settings>) -> Self {
        Self { kv, clock, settings }
    }

    /// `issue(anchor_identity) -> (challenge_id, ttl_s)`.
    pub async fn issue(&self, anchor: &str) -> Result<IssuedChallenge, GateError> {
        let issue_gap = self
            .settings
            .get_int("challenge_request_rate_limit_seconds")
            .await?;

        let issued_recently = !self
            .kv
            .set_nx_ex(&Self::issuance_key(anchor), "1", issue_gap)
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

        if issued_recently {
            let outcome = violations::record_breach(
                self.kv.as_ref(),
                self.clock.as_ref(),
                NAMESPACE,
                anchor,
                &CHALLENGE_BAN_LADDER,
            )
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

            return Err(GateError::too_many_challenges(
                Rejection::new(outcome.retry_after_seconds, outcome.violation_count)
                    .with_ban_expiry(outcome.ban_expires_at),
            ));
        }

        let ttl_seconds = self.settings.get_int("challenge_ttl_seconds").await?;
        let max_active = self
            .settings
            .get_int("max_active_challenges_per_identifier")
            .await?;

        let challenge_id = Uuid::new_v4().to_string();
        let now = self.clock.now_unix();

        self.kv
            .set_ex(
                &Self::record_key(&challenge_id),
                &format!("{now}:{expires_at}:{anchor}", expires_at = now + ttl_seconds),
                Some(ttl_seconds),
            )
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

        let evicted = self
            .kv
            .zadd_capped(&Self::active_set_key(anchor), &challenge_id, now, max_active)
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

        for stale_id in evicted {
            let _ = self.kv.del(&Self::record_key(&stale_id)).await;
            let _ = self.kv.zrem(&Self::active_set_key(anchor), &stale_id).await;
        }

        Ok(IssuedChallenge {
            challenge_id,
            ttl_seconds,
        })
    }

    /// `consume(challenge_id) -> bool`. Atomically deletes the record;
    /// true at most once across all time (spec.md §8 invariant 3).
    pub async fn consume(&self, challenge_id: &str) -> Result<bool, GateError> {
        self.kv
            .del(&Self::record_key(challenge_id))
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))
    }

    /// `peek(challenge_id) -> bool`. Non-destructive, diagnostics only.
    pub async fn peek(&self, challenge_id: &str) -> Result<bool, GateError> {
        self.kv
            .exists(&Self::record_key(challenge_id))
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))
    }

    fn record_key(challenge_id: &str) -> String {
        format!("ch:{challenge_id}")
    }

    fn active_set_key(anchor: &str) -> String {
        format!("ch:active:{anchor}")
    }

    fn issuance_key(anchor: &str) -> String {
        format!("ch:issue:{anchor}")
    }
}
