//! Shared progressive-ban ladder (spec.md §4.3, §4.5)
//!
//! The Rate and Challenge-spam violation classes both escalate bans
//! the same way: bump a 24 h violation counter, look up a ban duration
//! by ladder index, and write the ban with set-if-greater semantics so
//! a later, smaller breach at the same step never shortens a longer
//! pending ban (spec.md §5). Only the namespace and the ladder differ
//! between classes, so both go through this one function.

use crate::clock::Clock;
use crate::kv::{KvError, KvStore};

const VIOLATION_TTL_SECS: i64 = 86_400;

pub struct BanOutcome {
    pub violation_count: i64,
    pub ban_expires_at: i64,
    pub retry_after_seconds: i64,
}

fn ban_key(namespace: &str, identity: &str) -> String {
    format!("rl:ban:{namespace}:{identity}")
}

fn violation_key(namespace: &str, identity: &str) -> String {
    format!("rl:viol:{namespace}:{identity}")
}

/// Checks whether `identity` currently carries an unexpired ban in
/// `namespace`. Returns `(retry_after_seconds, ban_expires_at)` if so.
pub async fn check_ban(
    kv: &dyn KvStore,
    clock: &dyn Clock,
    namespace: &str,
    identity: &str,
) -> Result<Option<(i64, i64)>, KvError> {
    let now = clock.now_unix();
    match kv.get_expiry(&ban_key(namespace, identity)).await? {
        Some(expires_at) if expires_at > now => {
            Ok(Some(((expires_at - now).max(1), expires_at)))
        }
        _ => Ok(None),
    }
}

/// Records one breach: increments the violation counter, computes the
/// ladder step, and writes the ban. The ladder index is
/// `min(violation_count - 1, ladder.len() - 1)` — the first breach
/// (`violation_count == 1`) lands on `ladder[0]`.
pub async fn record_breach(
    kv: &dyn KvStore,
    clock: &dyn Clock,
    namespace: &str,
    identity: &str,
    ladder: &[i64],
) -> Result<BanOutcome, KvError> {
    let violation_count = kv
        .incr_with_ttl(&violation_key(namespace, identity), VIOLATION_TTL_SECS)
        .await?;

    let idx = ((violation_count - 1).max(0) as usize).min(ladder.len().saturating_sub(1));
    let ban_duration = ladder.get(idx).copied().unwrap_or(*ladder.last().unwrap_or(&60));

    let now = clock.now_unix();
    let candidate_expiry = now + ban_duration;
    let ban_key = ban_key(namespace, identity);
    kv.set_if_greater(&ban_key, candidate_expiry, now).await?;

    // set-if-greater may have kept a longer, pre-existing ban; report
    // the value that is actually in effect.
    let effective_expiry = kv
        .get_expiry(&ban_key)
        .await?
        .unwrap_or(candidate_expiry);

    Ok(BanOutcome {
        violation_count,
        ban_expires_at: effective_expiry,
        retry_after_seconds: (effective_expiry - now).max(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::kv::InMemoryKvStore;

    const LADDER: [i64; 4] = [60, 300, 900, 3600];

    #[tokio::test]
    async fn first_breach_uses_first_ladder_step() {
        let kv = InMemoryKvStore::new();
        let clock = FixedClock::new(1_000);
        let outcome = record_breach(&kv, &clock, "chat", "addr:1.2.3.4", &LADDER)
            .await
            .unwrap();
        assert_eq!(outcome.violation_count, 1);
        assert_eq!(outcome.ban_expires_at, 1_060);
    }

    #[tokio::test]
    async fn second_breach_escalates() {
        let kv = InMemoryKvStore::new();
        let clock = FixedClock::new(1_000);
        record_breach(&kv, &clock, "chat", "addr:1.2.3.4", &LADDER)
            .await
            .unwrap();
        clock.advance(120);
        let outcome = record_breach(&kv, &clock, "chat", "addr:1.2.3.4", &LADDER)
            .await
            .unwrap();
        assert_eq!(outcome.violation_count, 2);
        assert_eq!(outcome.ban_expires_at - clock.now_unix(), 300);
    }

    #[tokio::test]
    async fn a_shorter_breach_never_shortens_a_longer_ban() {
        let kv = InMemoryKvStore::new();
        let clock = FixedClock::new(1_000);
        kv.set_if_greater("rl:ban:chat:x", 10_000, 1_000)
            .await
            .unwrap();
        record_breach(&kv, &clock, "chat", "x", &LADDER).await.unwrap();
        assert_eq!(kv.get_expiry("rl:ban:chat:x").await.unwrap(), Some(10_000));
    }

    #[tokio::test]
    async fn check_ban_reports_none_once_expired() {
        let kv = InMemoryKvStore::new();
        let clock = FixedClock::new(1_000);
        record_breach(&kv, &clock, "chat", "x", &LADDER).await.unwrap();
        assert!(check_ban(&kv, &clock, "chat", "x").await.unwrap().is_some());
        clock.advance(61);
        kv.del("rl:ban:chat:x").await.unwrap();
        assert!(check_ban(&kv, &clock, "chat", "x").await.unwrap().is_none());
    }
}
