//! Settings admin endpoints (spec.md §6)
//!
//! `GET /admin/settings` lists every recognized key with its current
//! value and source. `PUT /admin/settings` accepts a partial map of
//! key/value pairs and validates each against its schema; a rejected
//! key leaves the prior value untouched (spec.md §8 round-trip
//! property) and is reported back per-key rather than failing the
//! whole request.
//!
//! Full admin authentication is explicitly out of scope — owned by the
//! external dashboard (spec.md §1) — but `require_admin_token` gates
//! these two routes behind a static bearer token for defense in depth
//! in a standalone deployment of this core.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::AppState;
use crate::settings::{SettingSource, SettingValue};

fn source_str(source: SettingSource) -> &'static str {
    match source {
        SettingSource::Static => "static",
        SettingSource::Dynamic => "dynamic",
    }
}

fn value_json(value: SettingValue) -> Value {
    match value {
        SettingValue::Int(v) => Value::from(v),
        SettingValue::Float(v) => Value::from(v),
        SettingValue::Bool(v) => Value::from(v),
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsListResponse {
    settings: BTreeMap<String, Value>,
    sources: BTreeMap<String, &'static str>,
}

/// Checks the optional static bearer token. Returns `Err` with the
/// response to short-circuit with when the check fails.
fn check_admin_token(state: &AppState, headers: &HeaderMap) -> Result<(), impl IntoResponse> {
    if !state.config.require_admin_token {
        return Ok(());
    }
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(state.config.admin_token.as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "missing or invalid admin token"))
    }
}

pub async fn get_settings(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(resp) = check_admin_token(&state, &headers) {
        return resp.into_response();
    }

    let mut settings = BTreeMap::new();
    let mut sources = BTreeMap::new();
    for (key, value, source) in state.settings.list().await {
        settings.insert(key.to_string(), value_json(value));
        sources.insert(key.to_string(), source_str(source));
    }

    Json(SettingsListResponse { settings, sources }).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SettingsUpdateRequest(BTreeMap<String, Value>);

#[derive(Debug, Serialize)]
pub struct SettingsUpdateResponse {
    applied: BTreeMap<String, bool>,
}

/// Converts a raw JSON value into the typed `SettingValue` the key's
/// schema expects, so a bool-typed key rejects `1` and a numeric key
/// rejects `"30"` rather than silently coercing.
fn to_setting_value(kind_hint: Option<SettingValue>, raw: &Value) -> Option<SettingValue> {
    match (kind_hint, raw) {
        (Some(SettingValue::Bool(_)), Value::Bool(b)) => Some(SettingValue::Bool(*b)),
        (Some(SettingValue::Int(_)), Value::Number(n)) => n.as_i64().map(SettingValue::Int),
        (Some(SettingValue::Float(_)), Value::Number(n)) => n.as_f64().map(SettingValue::Float),
        _ => None,
    }
}

pub async fn put_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SettingsUpdateRequest>,
) -> impl IntoResponse {
    if let Err(resp) = check_admin_token(&state, &headers) {
        return resp.into_response();
    }

    let current: BTreeMap<&'static str, SettingValue> = state
        .settings
        .list()
        .await
        .into_iter()
        .map(|(key, value, _)| (key, value))
        .collect();

    let mut applied = BTreeMap::new();
    for (key, raw) in body.0 {
        let existing = current
            .iter()
            .find(|(k, _)| **k == key)
            .map(|(_, v)| *v);

        let ok = match to_setting_value(existing, &raw) {
            Some(value) => state.settings.set(&key, value).await.is_ok(),
            None => false,
        };
        applied.insert(key, ok);
    }

    Json(SettingsUpdateResponse { applied }).into_response()
}
