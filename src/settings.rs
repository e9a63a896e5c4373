//! Settings Registry (C7)
//!
//! Dynamic policy values with two-tier lookup: a KV-store override (if
//! present and well-formed) wins over the hard-coded static default.
//! Writes are validated against a per-key schema (bounds, type) before
//! being persisted, and are visible to subsequent admission decisions
//! immediately — there is no authoritative in-process cache (spec.md
//! §5). The short-TTL cache here exists purely to avoid a KV round
//! trip on every admission; `set()` both clears the local entry and
//! publishes on `settings:invalidate` so every other process sees the
//! change within one cache TTL even without pub/sub if its subscriber
//! task is not wired up.

use crate::error::GateError;
use crate::kv::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl SettingValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Float(v) => Some(*v),
            SettingValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    fn encode(&self) -> String {
        match self {
            SettingValue::Int(v) => v.to_string(),
            SettingValue::Float(v) => v.to_string(),
            SettingValue::Bool(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSource {
    Static,
    Dynamic,
}

/// Schema for one recognized key: its type and, for numerics, inclusive
/// bounds. Mirrors the table in spec.md §6.
#[derive(Debug, Clone, Copy)]
struct SettingSpec {
    key: &'static str,
    kind: SettingKind,
    min: f64,
    max: f64,
    default: f64,
}

const SPECS: &[SettingSpec] = &[
    SettingSpec { key: "rate_limit_per_minute", kind: SettingKind::Int, min: 1.0, max: f64::MAX, default: 30.0 },
    SettingSpec { key: "rate_limit_per_hour", kind: SettingKind::Int, min: 1.0, max: f64::MAX, default: 300.0 },
    SettingSpec { key: "global_rate_limit_per_minute", kind: SettingKind::Int, min: 1.0, max: f64::MAX, default: 1000.0 },
    SettingSpec { key: "global_rate_limit_per_hour", kind: SettingKind::Int, min: 1.0, max: f64::MAX, default: 20_000.0 },
    SettingSpec { key: "enable_global_rate_limit", kind: SettingKind::Bool, min: 0.0, max: 1.0, default: 1.0 },
    SettingSpec { key: "daily_spend_limit_usd", kind: SettingKind::Float, min: f64::MIN_POSITIVE, max: f64::MAX, default: 50.0 },
    SettingSpec { key: "hourly_spend_limit_usd", kind: SettingKind::Float, min: f64::MIN_POSITIVE, max: f64::MAX, default: 5.0 },
    SettingSpec { key: "enable_cost_throttling", kind: SettingKind::Bool, min: 0.0, max: 1.0, default: 1.0 },
    SettingSpec { key: "high_cost_threshold_usd", kind: SettingKind::Float, min: f64::MIN_POSITIVE, max: f64::MAX, default: 0.015 },
    SettingSpec { key: "high_cost_window_seconds", kind: SettingKind::Int, min: 60.0, max: f64::MAX, default: 600.0 },
    SettingSpec { key: "cost_throttle_duration_seconds", kind: SettingKind::Int, min: 1.0, max: f64::MAX, default: 30.0 },
    SettingSpec { key: "daily_cost_limit_usd", kind: SettingKind::Float, min: 0.0, max: f64::MAX, default: 0.0 },
    SettingSpec { key: "challenge_ttl_seconds", kind: SettingKind::Int, min: 60.0, max: f64::MAX, default: 300.0 },
    SettingSpec { key: "max_active_challenges_per_identifier", kind: SettingKind::Int, min: 1.0, max: f64::MAX, default: 5.0 },
    SettingSpec { key: "challenge_request_rate_limit_seconds", kind: SettingKind::Int, min: 1.0, max: 3.0, default: 3.0 },
    SettingSpec { key: "enable_challenge_response", kind: SettingKind::Bool, min: 0.0, max: 1.0, default: 1.0 },
];

fn spec_for(key: &str) -> Option<&'static SettingSpec> {
    SPECS.iter().find(|s| s.key == key)
}

fn kv_key(key: &str) -> String {
    format!("settings:{key}")
}

struct CacheEntry {
    value: SettingValue,
    source: SettingSource,
    cached_at: Instant,
}

/// `daily_cost_limit_usd` of `0.0` means "off" — the table in spec.md
/// §6 marks it "optional, default off" without naming a sentinel; zero
/// is the natural one since the key otherwise requires a positive
/// decimal (see DESIGN.md).
pub const DISABLED_SENTINEL: f64 = 0.0;

/// The settings registry. Construct one per process and share it via
/// `Arc` — it owns its own short-lived cache.
pub struct Settings {
    kv: Arc<dyn KvStore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

const INVALIDATE_CHANNEL: &str = "settings:invalidate";

impl Settings {
    pub fn new(kv: Arc<dyn KvStore>, cache_ttl: Duration) -> Self {
        Self {
            kv,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    fn decode(spec: &SettingSpec, raw: &str) -> Option<SettingValue> {
        match spec.kind {
            SettingKind::Int => raw.parse::<i64>().ok().map(SettingValue::Int),
            SettingKind::Float => raw.parse::<f64>().ok().map(SettingValue::Float),
            SettingKind::Bool => match raw {
                "true" => Some(SettingValue::Bool(true)),
                "false" => Some(SettingValue::Bool(false)),
                _ => None,
            },
        }
    }

    fn default_value(spec: &SettingSpec) -> SettingValue {
        match spec.kind {
            SettingKind::Int => SettingValue::Int(spec.default as i64),
            SettingKind::Float => SettingValue::Float(spec.default),
            SettingKind::Bool => SettingValue::Bool(spec.default != 0.0),
        }
    }

    fn in_bounds(spec: &SettingSpec, value: &SettingValue) -> bool {
        match value {
            SettingValue::Int(v) => (*v as f64) >= spec.min && (*v as f64) <= spec.max,
            SettingValue::Float(v) => *v >= spec.min && *v <= spec.max,
            SettingValue::Bool(_) => true,
        }
    }

    /// `get(key) -> (value, source)`. Falls back to the static default
    /// on any KV fault or malformed override (spec.md §7: "settings
    /// reads fall back to static values").
    pub async fn get(&self, key: &str) -> Result<(SettingValue, SettingSource), GateError> {
        let spec = spec_for(key).ok_or_else(|| {
            GateError::internal(anyhow::anyhow!("unrecognized setting key: {key}"))
        })?;

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(key) {
                if entry.cached_at.elapsed() < self.cache_ttl {
                    return Ok((entry.value, entry.source));
                }
            }
        }

        let (value, source) = match self.kv.get_str(&kv_key(key)).await {
            Ok(Some(raw)) => match Self::decode(spec, &raw) {
                Some(v) if Self::in_bounds(spec, &v) => (v, SettingSource::Dynamic),
                _ => {
                    tracing::warn!(key, raw, "malformed settings override, using static default");
                    (Self::default_value(spec), SettingSource::Static)
                }
            },
            Ok(None) => (Self::default_value(spec), SettingSource::Static),
            Err(e) => {
                tracing::warn!(key, error = %e, "settings read failed, using static default");
                (Self::default_value(spec), SettingSource::Static)
            }
        };

        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                value,
                source,
                cached_at: Instant::now(),
            },
        );

        Ok((value, source))
    }

    pub async fn get_int(&self, key: &str) -> Result<i64, GateError> {
        Ok(self.get(key).await?.0.as_i64().unwrap_or_default())
    }

    pub async fn get_float(&self, key: &str) -> Result<f64, GateError> {
        Ok(self.get(key).await?.0.as_f64().unwrap_or_default())
    }

    pub async fn get_bool(&self, key: &str) -> Result<bool, GateError> {
        Ok(self.get(key).await?.0.as_bool().unwrap_or_default())
    }

    /// `set(key, value)`. Rejects unrecognized keys and out-of-schema
    /// values; a rejected write leaves the prior value untouched
    /// (spec.md §8 round-trip property).
    pub async fn set(&self, key: &str, value: SettingValue) -> Result<(), GateError> {
        let spec = spec_for(key).ok_or_else(|| {
            GateError::internal(anyhow::anyhow!("unrecognized setting key: {key}"))
        })?;

        let kind_matches = matches!(
            (spec.kind, value),
            (SettingKind::Int, SettingValue::Int(_))
                | (SettingKind::Float, SettingValue::Float(_) | SettingValue::Int(_))
                | (SettingKind::Bool, SettingValue::Bool(_))
        );
        if !kind_matches || !Self::in_bounds(spec, &value) {
            return Err(GateError::internal(anyhow::anyhow!(
                "value out of schema for key {key}"
            )));
        }

        self.kv
            .set_ex(&kv_key(key), &value.encode(), None)
            .await
            .map_err(|e| GateError::internal(anyhow::anyhow!(e)))?;

        self.invalidate_key(key).await;
        let _ = self.kv.publish(INVALIDATE_CHANNEL, key).await;

        Ok(())
    }

    /// `list()` for the admin surface: every recognized key with its
    /// current value and source.
    pub async fn list(&self) -> Vec<(&'static str, SettingValue, SettingSource)> {
        let mut out = Vec::with_capacity(SPECS.len());
        for spec in SPECS {
            let (value, source) = self
                .get(spec.key)
                .await
                .unwrap_or((Self::default_value(spec), SettingSource::Static));
            out.push((spec.key, value, source));
        }
        out
    }

    pub async fn invalidate_key(&self, key: &str) {
        self.cache.write().await.remove(key);
    }

    /// Called by the pub/sub listener task when another process writes
    /// a setting.
    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn registry() -> Settings {
        Settings::new(Arc::new(InMemoryKvStore::new()), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn unset_key_returns_static_default() {
        let settings = registry();
        let (value, source) = settings.get("rate_limit_per_minute").await.unwrap();
        assert_eq!(value, SettingValue::Int(30));
        assert_eq!(source, SettingSource::Static);
    }

    #[tokio::test]
    async fn set_then_get_round_trips_as_dynamic() {
        let settings = registry();
        settings
            .set("rate_limit_per_minute", SettingValue::Int(5))
            .await
            .unwrap();
        let (value, source) = settings.get("rate_limit_per_minute").await.unwrap();
        assert_eq!(value, SettingValue::Int(5));
        assert_eq!(source, SettingSource::Dynamic);
    }

    #[tokio::test]
    async fn out_of_bounds_write_is_rejected_and_prior_value_survives() {
        let settings = registry();
        settings
            .set("rate_limit_per_minute", SettingValue::Int(10))
            .await
            .unwrap();
        assert!(settings
            .set("rate_limit_per_minute", SettingValue::Int(0))
            .await
            .is_err());
        let (value, _) = settings.get("rate_limit_per_minute").await.unwrap();
        assert_eq!(value, SettingValue::Int(10));
    }

    #[tokio::test]
    async fn unrecognized_key_is_rejected() {
        let settings = registry();
        assert!(settings.get("not_a_real_key").await.is_err());
    }

    #[tokio::test]
    async fn list_covers_every_recognized_key() {
        let settings = registry();
        let listed = settings.list().await;
        assert_eq!(listed.len(), SPECS.len());
    }
}
