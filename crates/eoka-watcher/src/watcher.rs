//! Watcher definitions, from raw registration input to live state.

use crate::config::Limits;
use crate::locator::Locator;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest accepted watcher name.
pub const MAX_NAME_LEN: usize = 128;

/// Unvalidated watcher registration, as it arrives from a caller or a config file.
///
/// Fields are loosely typed so malformed input surfaces as a validation error
/// naming the field instead of a generic parse failure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawWatcherSpec {
    pub name: Option<Value>,
    #[serde(alias = "referenceLocator")]
    pub reference_locator: Option<Value>,
    #[serde(alias = "actionLocator")]
    pub action_locator: Option<Value>,
    pub duration: Option<Value>,
    pub priority: Option<Value>,
    #[serde(alias = "stopOnFound")]
    pub stop_on_found: Option<Value>,
    #[serde(alias = "cooldownMs")]
    pub cooldown_ms: Option<Value>,
}

impl RawWatcherSpec {
    /// Check every field and produce a typed spec.
    pub fn validate(&self, limits: &Limits) -> Result<WatcherSpec> {
        let name = match &self.name {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::String(_)) => return Err(Error::Validation("name must not be empty".into())),
            Some(_) => return Err(Error::Validation("name must be a string".into())),
            None => return Err(Error::Validation("name is required".into())),
        };
        if name.len() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "name must be at most {} characters",
                MAX_NAME_LEN
            )));
        }

        let reference_locator = Locator::from_json(
            self.reference_locator
                .as_ref()
                .ok_or_else(|| Error::Validation("referenceLocator is required".into()))?,
            "referenceLocator",
        )?;
        let action_locator = Locator::from_json(
            self.action_locator
                .as_ref()
                .ok_or_else(|| Error::Validation("actionLocator is required".into()))?,
            "actionLocator",
        )?;

        let duration_ms = match &self.duration {
            Some(v) => v.as_u64().filter(|d| *d > 0).ok_or_else(|| {
                Error::Validation("duration must be a positive integer (ms)".into())
            })?,
            None => return Err(Error::Validation("duration is required".into())),
        };
        if duration_ms > limits.max_duration_ms {
            return Err(Error::Validation(format!(
                "duration must be between 1 and {} ms, got {}",
                limits.max_duration_ms, duration_ms
            )));
        }

        let priority = match &self.priority {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| Error::Validation("priority must be an integer".into()))?,
        };

        let stop_on_found = match &self.stop_on_found {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(Error::Validation("stopOnFound must be a boolean".into())),
        };

        let cooldown_ms = match &self.cooldown_ms {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                Error::Validation("cooldownMs must be a non-negative integer".into())
            })?,
        };
        if cooldown_ms > limits.max_duration_ms {
            return Err(Error::Validation(format!(
                "cooldownMs must be at most {} ms, got {}",
                limits.max_duration_ms, cooldown_ms
            )));
        }

        Ok(WatcherSpec {
            name,
            priority,
            reference_locator,
            action_locator,
            duration_ms,
            stop_on_found,
            cooldown_ms,
        })
    }
}

/// A validated watcher definition, ready to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSpec {
    pub name: String,
    pub priority: i64,
    pub reference_locator: Locator,
    pub action_locator: Locator,
    pub duration_ms: u64,
    pub stop_on_found: bool,
    pub cooldown_ms: u64,
}

impl WatcherSpec {
    /// Watcher with default priority, no stop-on-found and no cooldown.
    pub fn new(
        name: impl Into<String>,
        reference_locator: Locator,
        action_locator: Locator,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            reference_locator,
            action_locator,
            duration_ms,
            stop_on_found: false,
            cooldown_ms: 0,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn stop_on_found(mut self, stop: bool) -> Self {
        self.stop_on_found = stop;
        self
    }

    pub fn cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStatus {
    Active,
    Inactive,
}

/// A registered watcher and its lifecycle state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Watcher {
    pub name: String,
    pub priority: i64,
    pub reference_locator: Locator,
    pub action_locator: Locator,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub stop_on_found: bool,
    pub cooldown_ms: u64,
    pub registered_at: u64,
    pub expires_at: u64,
    pub status: WatcherStatus,
    pub trigger_count: u64,
    pub last_triggered_at: Option<u64>,
    /// Registration order, breaks ties between equal timestamps.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Watcher {
    pub(crate) fn new(spec: WatcherSpec, now: u64, seq: u64) -> Self {
        Self {
            name: spec.name,
            priority: spec.priority,
            reference_locator: spec.reference_locator,
            action_locator: spec.action_locator,
            duration_ms: spec.duration_ms,
            stop_on_found: spec.stop_on_found,
            cooldown_ms: spec.cooldown_ms,
            registered_at: now,
            expires_at: now.saturating_add(spec.duration_ms),
            status: WatcherStatus::Active,
            trigger_count: 0,
            last_triggered_at: None,
            seq,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.status == WatcherStatus::Active
    }

    pub fn summary(&self) -> WatcherSummary {
        WatcherSummary {
            name: self.name.clone(),
            priority: self.priority,
            registered_at: self.registered_at,
            expires_at: self.expires_at,
            status: self.status,
        }
    }
}

/// Registration response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherSummary {
    pub name: String,
    pub priority: i64,
    pub registered_at: u64,
    pub expires_at: u64,
    pub status: WatcherStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> RawWatcherSpec {
        serde_json::from_value(v).unwrap()
    }

    fn base() -> Value {
        json!({
            "name": "consent",
            "referenceLocator": {"using": "id", "value": "consent"},
            "actionLocator": {"using": "css selector", "value": "#consent .ok"},
            "duration": 30000
        })
    }

    #[test]
    fn test_defaults_applied() {
        let spec = raw(base()).validate(&Limits::default()).unwrap();
        assert_eq!(spec.name, "consent");
        assert_eq!(spec.priority, 0);
        assert!(!spec.stop_on_found);
        assert_eq!(spec.cooldown_ms, 0);
        assert_eq!(spec.duration_ms, 30000);
    }

    #[test]
    fn test_snake_case_fields_accepted() {
        let spec = raw(json!({
            "name": "promo",
            "reference_locator": {"using": "xpath", "value": "//div[@class='promo']"},
            "action_locator": {"using": "xpath", "value": "//button[.='x']"},
            "duration": 1000,
            "priority": 7,
            "stop_on_found": true,
            "cooldown_ms": 250
        }))
        .validate(&Limits::default())
        .unwrap();
        assert_eq!(spec.priority, 7);
        assert!(spec.stop_on_found);
        assert_eq!(spec.cooldown_ms, 250);
    }

    #[test]
    fn test_duration_bounds() {
        let limits = Limits::default();
        for bad in [json!(0), json!(-5), json!(60001), json!("100"), json!(1.5)] {
            let mut v = base();
            v["duration"] = bad.clone();
            let err = raw(v).validate(&limits).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{:?} accepted", bad);
        }
        let mut v = base();
        v["duration"] = json!(60000);
        assert!(raw(v).validate(&limits).is_ok());
    }

    #[test]
    fn test_missing_and_malformed_fields() {
        let limits = Limits::default();
        for field in ["name", "referenceLocator", "actionLocator", "duration"] {
            let mut v = base();
            v.as_object_mut().unwrap().remove(field);
            let err = raw(v).validate(&limits).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }

        let mut v = base();
        v["name"] = json!("   ");
        assert!(raw(v).validate(&limits).is_err());

        let mut v = base();
        v["priority"] = json!("high");
        assert!(raw(v).validate(&limits).is_err());

        let mut v = base();
        v["stopOnFound"] = json!("yes");
        assert!(raw(v).validate(&limits).is_err());

        let mut v = base();
        v["cooldownMs"] = json!(-1);
        assert!(raw(v).validate(&limits).is_err());

        let mut v = base();
        v["cooldownMs"] = json!(1_000_000_000_000u64);
        let err = raw(v).validate(&limits).unwrap_err();
        assert!(err.to_string().contains("cooldownMs must be at most 60000"), "{}", err);

        let mut v = base();
        v["cooldownMs"] = json!(60_000);
        assert!(raw(v).validate(&limits).is_ok());

        let mut v = base();
        v["actionLocator"] = json!({"using": "jquery", "value": "$('.x')"});
        assert!(raw(v).validate(&limits).is_err());
    }

    #[test]
    fn test_watcher_expiry_arithmetic() {
        let spec = raw(base()).validate(&Limits::default()).unwrap();
        let w = Watcher::new(spec, 1_000, 0);
        assert_eq!(w.expires_at, w.registered_at + w.duration_ms);
        assert!(!w.is_expired(30_999));
        assert!(w.is_expired(31_000));
    }

    #[test]
    fn test_watcher_serializes_camel_case() {
        let spec = raw(base()).validate(&Limits::default()).unwrap();
        let v = serde_json::to_value(Watcher::new(spec, 5, 0)).unwrap();
        assert_eq!(v["registeredAt"], 5);
        assert_eq!(v["expiresAt"], 30005);
        assert_eq!(v["status"], "active");
        assert_eq!(v["triggerCount"], 0);
        assert!(v["lastTriggeredAt"].is_null());
        assert!(v.get("seq").is_none());
    }
}
