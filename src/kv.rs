//! Shared KV store abstraction (C1)
//!
//! Every piece of cross-process policy state (counters, bans, challenges,
//! settings overrides) lives behind this trait. The production
//! implementation talks to Redis through an async `ConnectionManager` and
//! leans on Lua scripts for the operations spec.md §5 requires to be
//! atomic — a counter increment plus its TTL, or a ban write that never
//! shortens a longer pending ban. A plain GET-then-SET pair cannot give
//! those guarantees once two requests for the same identity race, so we
//! push the read-modify-write into Redis itself.
//!
//! `InMemoryKvStore` backs unit tests; it is intentionally not used in
//! production — `KvStore` is a trait precisely so nothing in the gate,
//! rate limiter, cost governor, or challenge service needs to know which
//! one it's talking to.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};

/// Errors surfaced by the KV store. Every variant maps to "treat as
/// unavailable" in callers — per spec.md §7 the core never propagates raw
/// backend error text to an HTTP client.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("KV backend error: {0}")]
    Backend(String),

    #[error("KV operation timed out")]
    Timeout,
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        KvError::Backend(e.to_string())
    }
}

/// Atomic operations over the shared KV store. All methods are
/// suspension points (spec.md §5) — implementations must not block a
/// worker thread.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increments `key` by `delta`. If the key did not exist
    /// before this call (post-increment value equals `delta`), sets its
    /// TTL to `ttl_secs`. Returns the new value.
    async fn incr_by_with_ttl(&self, key: &str, delta: i64, ttl_secs: i64)
        -> Result<i64, KvError>;

    /// Convenience wrapper over `incr_by_with_ttl` for the common +1 case.
    async fn incr_with_ttl(&self, key: &str, ttl_secs: i64) -> Result<i64, KvError> {
        self.incr_by_with_ttl(key, 1, ttl_secs).await
    }

    /// Reads an integer counter. Absent/expired reads as zero (spec.md §3
    /// invariant: "an expired counter is equivalent to zero").
    async fn get_i64(&self, key: &str) -> Result<i64, KvError>;

    /// Remaining TTL in seconds, or `None` if the key has no TTL or does
    /// not exist.
    async fn ttl(&self, key: &str) -> Result<Option<i64>, KvError>;

    /// Set-if-greater: writes `expires_at` (an epoch second) to `key` only
    /// if it exceeds the current value (or the key is absent), with TTL
    /// set to the remaining time until `expires_at`. This is how ban
    /// writes honor "a longer pending ban is never shortened" (spec.md
    /// §5).
    async fn set_if_greater(&self, key: &str, expires_at: i64, now: i64) -> Result<(), KvError>;

    /// Reads a ban/throttle record's epoch-second expiry, if present and
    /// unexpired.
    async fn get_expiry(&self, key: &str) -> Result<Option<i64>, KvError>;

    /// Sets `key` to `value` only if absent, with TTL `ttl_secs`. Returns
    /// whether the write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: i64) -> Result<bool, KvError>;

    /// Unconditional write. `ttl_secs` of `None` means no expiry (used
    /// for settings overrides, which live until explicitly changed).
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> Result<(), KvError>;

    /// Reads a plain string value.
    async fn get_str(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Unconditional delete. Returns whether the key existed — this is
    /// the atomic "consume" primitive challenges rely on (spec.md §4.2:
    /// `consume` must return true at most once).
    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Non-destructive existence check.
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Adds `member` with `score` to the sorted set at `key`, then evicts
    /// the lowest-scored members beyond `cap` entries. Returns the
    /// evicted members (spec.md §4.2: "if exceeded, oldest are evicted
    /// before the new one is issued").
    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: i64,
        cap: i64,
    ) -> Result<Vec<String>, KvError>;

    /// Removes `member` from the sorted set at `key`.
    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError>;

    /// Publishes `message` on `channel` (used for settings invalidation).
    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;
}

const INCR_WITH_TTL_SCRIPT: &str = r#"
local new = redis.call('INCRBY', KEYS[1], ARGV[1])
if new == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return new
"#;

const SET_IF_GREATER_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local new_expiry = tonumber(ARGV[1])
if new_expiry > current then
    local ttl = new_expiry - tonumber(ARGV[2])
    if ttl > 0 then
        redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
    end
    return 1
end
return 0
"#;

const ZADD_CAPPED_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
local cap = tonumber(ARGV[3])
local count = redis.call('ZCARD', KEYS[1])
local evicted = {}
if count > cap then
    local overflow = count - cap
    local stale = redis.call('ZRANGE', KEYS[1], 0, overflow - 1)
    for _, member in ipairs(stale) do
        table.insert(evicted, member)
        redis.call('ZREM', KEYS[1], member)
    end
end
return evicted
"#;

/// Redis-backed `KvStore`. Holds an async `ConnectionManager`, which
/// transparently reconnects and is cheap to clone (it's a handle, not a
/// raw socket), matching the pattern used for rate-limit state across
/// the pack's other axum services.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    timeout: Duration,
    incr_script: Script,
    set_if_greater_script: Script,
    zadd_capped_script: Script,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            timeout,
            incr_script: Script::new(INCR_WITH_TTL_SCRIPT),
            set_if_greater_script: Script::new(SET_IF_GREATER_SCRIPT),
            zadd_capped_script: Script::new(ZADD_CAPPED_SCRIPT),
        })
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, KvError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn incr_by_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl_secs: i64,
    ) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        self.with_timeout(
            self.incr_script
                .key(key)
                .arg(delta)
                .arg(ttl_secs)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn get_i64(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self.with_timeout(conn.get(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, KvError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = self.with_timeout(conn.ttl(key)).await?;
        Ok(if ttl >= 0 { Some(ttl) } else { None })
    }

    async fn set_if_greater(&self, key: &str, expires_at: i64, now: i64) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .with_timeout(
                self.set_if_greater_script
                    .key(key)
                    .arg(expires_at)
                    .arg(now)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn get_expiry(&self, key: &str) -> Result<Option<i64>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self.with_timeout(conn.get(key)).await?;
        Ok(value)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: i64) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = self
            .with_timeout(redis::cmd("SET").arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs).query_async(&mut conn))
            .await?;
        Ok(result.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        match ttl_secs {
            Some(ttl) => self.with_timeout(conn.set_ex(key, value, ttl as u64)).await,
            None => self.with_timeout(conn.set(key, value)).await,
        }
    }

    async fn get_str(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        self.with_timeout(conn.get(key)).await
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let count: i64 = self.with_timeout(conn.del(key)).await?;
        Ok(count > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let exists: bool = self.with_timeout(conn.exists(key)).await?;
        Ok(exists)
    }

    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: i64,
        cap: i64,
    ) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        self.with_timeout(
            self.zadd_capped_script
                .key(key)
                .arg(member)
                .arg(score)
                .arg(cap)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: i64 = self.with_timeout(conn.zrem(key, member)).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: i64 = self.with_timeout(conn.publish(channel, message)).await?;
        Ok(())
    }
}

/// A counter with the epoch second it expires at, `None` meaning no TTL.
struct CounterEntry {
    value: i64,
    expires_at: Option<i64>,
}

/// A string value with the epoch second it expires at, `None` meaning no
/// TTL (settings overrides, and the raw expiry value a ban/throttle
/// record holds, both live until explicitly overwritten/deleted).
struct StringEntry {
    value: String,
    expires_at: Option<i64>,
}

/// In-process fake used by unit tests across the gate/rate-limiter/cost-
/// governor/challenge modules. Mirrors the same atomicity contracts as
/// `RedisKvStore` (single `Mutex` stands in for Redis's single-threaded
/// command execution) without requiring a running Redis — including TTL
/// expiry, which it evaluates lazily against an injected `Clock` rather
/// than a background sweep, so tests can drive window/gap resets with a
/// `FixedClock` instead of sleeping in real time.
pub struct InMemoryKvStore {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, CounterEntry>>,
    strings: Mutex<HashMap<String, StringEntry>>,
    sorted_sets: Mutex<HashMap<String, Vec<(String, i64)>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    /// Backs TTL expiry with the real wall clock. Fine for tests that
    /// never assert on window/gap resets; tests that do (ladder
    /// escalation across a ban window, active-set eviction across the
    /// issuance gap) should use `with_clock` and share the same
    /// `FixedClock` they advance elsewhere, so the store's notion of
    /// "now" stays in lockstep with the service under test.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
            strings: Mutex::new(HashMap::new()),
            sorted_sets: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Test helper: inspect published (channel, message) pairs.
    pub fn published_messages(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn incr_by_with_ttl(
        &self,
        key: &str,
        delta: i64,
        ttl_secs: i64,
    ) -> Result<i64, KvError> {
        let now = self.clock.now_unix();
        let mut counters = self.counters.lock().unwrap();

        let is_expired = counters
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|exp| now >= exp);
        if is_expired {
            counters.remove(key);
        }

        let is_new = !counters.contains_key(key);
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += delta;
        if is_new {
            entry.expires_at = Some(now + ttl_secs);
        }
        Ok(entry.value)
    }

    async fn get_i64(&self, key: &str) -> Result<i64, KvError> {
        let now = self.clock.now_unix();
        let mut counters = self.counters.lock().unwrap();
        if let Some(entry) = counters.get(key) {
            if entry.expires_at.is_some_and(|exp| now >= exp) {
                counters.remove(key);
                return Ok(0);
            }
            return Ok(entry.value);
        }
        Ok(0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, KvError> {
        let now = self.clock.now_unix();
        let mut counters = self.counters.lock().unwrap();
        let Some(entry) = counters.get(key) else {
            return Ok(None);
        };
        match entry.expires_at {
            Some(exp) if exp > now => Ok(Some(exp - now)),
            Some(_) => {
                counters.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_if_greater(&self, key: &str, expires_at: i64, _now: i64) -> Result<(), KvError> {
        // The stored value *is* the expiry timestamp; callers compare it
        // against their own clock (see violations::check_ban), so this
        // fake must not apply a second, independent staleness check here.
        let mut strings = self.strings.lock().unwrap();
        let current = strings
            .get(key)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        if expires_at > current {
            strings.insert(
                key.to_string(),
                StringEntry {
                    value: expires_at.to_string(),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn get_expiry(&self, key: &str) -> Result<Option<i64>, KvError> {
        Ok(self
            .strings
            .lock()
            .unwrap()
            .get(key)
            .and_then(|e| e.value.parse::<i64>().ok()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: i64) -> Result<bool, KvError> {
        let now = self.clock.now_unix();
        let mut strings = self.strings.lock().unwrap();
        let occupied = strings
            .get(key)
            .is_some_and(|e| e.expires_at.is_none_or(|exp| exp > now));
        if occupied {
            Ok(false)
        } else {
            strings.insert(
                key.to_string(),
                StringEntry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl_secs),
                },
            );
            Ok(true)
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: Option<i64>) -> Result<(), KvError> {
        let now = self.clock.now_unix();
        self.strings.lock().unwrap().insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl_secs.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn get_str(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = self.clock.now_unix();
        let mut strings = self.strings.lock().unwrap();
        let Some(entry) = strings.get(key) else {
            return Ok(None);
        };
        if entry.expires_at.is_some_and(|exp| exp <= now) {
            strings.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let removed_string = self.strings.lock().unwrap().remove(key).is_some();
        let removed_counter = self.counters.lock().unwrap().remove(key).is_some();
        Ok(removed_string || removed_counter)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let now = self.clock.now_unix();
        let mut strings = self.strings.lock().unwrap();
        let string_live = match strings.get(key) {
            Some(entry) if entry.expires_at.is_some_and(|exp| exp <= now) => {
                strings.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        };
        drop(strings);

        let mut counters = self.counters.lock().unwrap();
        let counter_live = match counters.get(key) {
            Some(entry) if entry.expires_at.is_some_and(|exp| exp <= now) => {
                counters.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        };

        Ok(string_live || counter_live)
    }

    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: i64,
        cap: i64,
    ) -> Result<Vec<String>, KvError> {
        let mut sets = self.sorted_sets.lock().unwrap();
        let set = sets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        set.sort_by_key(|(_, s)| *s);

        let mut evicted = Vec::new();
        while set.len() as i64 > cap {
            let (m, _) = set.remove(0);
            evicted.push(m);
        }
        Ok(evicted)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(set) = self.sorted_sets.lock().unwrap().get_mut(key) {
            set.retain(|(m, _)| m != member);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}
