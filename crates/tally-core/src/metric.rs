//! # Metrics and Identity Keys
//!
//! The common cross-provider metric shape and the rules that decide when two
//! observations are "the same" row.
//!
//! ## Identity Key
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  (account_id, metric_type, date, project_id | NULL, metadata_json)     │
//! │                                                                         │
//! │  acct-1, revenue, 2026-02-01, NULL, {"country":"DE"}   ─┐  distinct    │
//! │  acct-1, revenue, 2026-02-01, NULL, {"country":"FR"}   ─┘  rows        │
//! │                                                                         │
//! │  acct-1, revenue, 2026-02-01, app-7, {}                ─┐  same row,   │
//! │  acct-1, revenue, 2026-02-01, app-7, {}                ─┘  last wins   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Metadata takes part in the key through its canonical JSON text: object keys
//! are sorted at every nesting level, so `{"b":1,"a":2}` and `{"a":2,"b":1}`
//! collide regardless of how the provider ordered them.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Metadata
// =============================================================================

/// Free-form sub-key attributes of a metric (country, plan, interval, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricMetadata(BTreeMap<String, Value>);

impl MetricMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic JSON text with keys sorted at every level. `{}` when empty.
    pub fn canonical_json(&self) -> String {
        let mut out = String::from("{");
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_json_string(&mut out, key);
            out.push(':');
            write_canonical(&mut out, value);
        }
        out.push('}');
        out
    }

    /// Parses stored metadata text back into a map.
    pub fn from_json(text: &str) -> CoreResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text).map_err(|e| CoreError::Metadata(e.to_string()))
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        // Scalars already have a single serde_json text form.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(out: &mut String, s: &str) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

// =============================================================================
// Normalized Metric
// =============================================================================

/// One observation in the common cross-provider shape, as returned by a fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMetric {
    /// e.g. "revenue", "mrr", "active_subscriptions", "new_customers".
    pub metric_type: String,

    pub value: f64,

    /// ISO date (`YYYY-MM-DD`) the observation applies to.
    pub date: NaiveDate,

    /// ISO 4217 code for monetary metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,

    /// Provider-side project id; `None` means account-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Display name used if the project has to be auto-registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    #[serde(default, skip_serializing_if = "MetricMetadata::is_empty")]
    pub metadata: MetricMetadata,

    /// Provisional value from an aggregation window that has not closed yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl NormalizedMetric {
    pub fn new(metric_type: impl Into<String>, value: f64, date: NaiveDate) -> Self {
        NormalizedMetric {
            metric_type: metric_type.into(),
            value,
            date,
            currency: None,
            project_id: None,
            project_name: None,
            metadata: MetricMetadata::default(),
            pending: false,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_project(mut self, id: impl Into<String>, name: Option<String>) -> Self {
        self.project_id = Some(id.into());
        self.project_name = name;
        self
    }

    pub fn with_metadata(mut self, metadata: MetricMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    /// Identity key of this observation within `account_id`.
    pub fn identity_key(&self, account_id: &str) -> IdentityKey {
        IdentityKey {
            account_id: account_id.to_string(),
            metric_type: self.metric_type.clone(),
            date: self.date,
            project_id: self.project_id.clone(),
            metadata: self.metadata.canonical_json(),
        }
    }
}

// =============================================================================
// Identity Key
// =============================================================================

/// The tuple that decides whether two observations are the same stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub account_id: String,
    pub metric_type: String,
    pub date: NaiveDate,
    pub project_id: Option<String>,
    /// Canonical JSON text of the metadata.
    pub metadata: String,
}

impl IdentityKey {
    /// The metadata-free slot the pending rule clears.
    pub fn slot(&self) -> (&str, &str, NaiveDate, Option<&str>) {
        (
            &self.account_id,
            &self.metric_type,
            self.date,
            self.project_id.as_deref(),
        )
    }
}

// =============================================================================
// Stored Metric
// =============================================================================

/// A persisted metric row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: String,
    pub account_id: String,
    pub project_id: Option<String>,
    pub metric_type: String,
    pub value: f64,
    pub currency: Option<String>,
    pub date: NaiveDate,
    pub metadata: MetricMetadata,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feb_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = MetricMetadata::new()
            .with("plan", json!({"interval": "month", "amount": 10}))
            .with("country", "DE");
        let b = MetricMetadata::new()
            .with("country", "DE")
            .with("plan", json!({"amount": 10, "interval": "month"}));

        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(
            a.canonical_json(),
            r#"{"country":"DE","plan":{"amount":10,"interval":"month"}}"#
        );
    }

    #[test]
    fn test_empty_metadata_is_empty_object() {
        assert_eq!(MetricMetadata::new().canonical_json(), "{}");
        assert_eq!(MetricMetadata::from_json("").unwrap(), MetricMetadata::new());
    }

    #[test]
    fn test_canonical_json_round_trips() {
        let meta = MetricMetadata::new()
            .with("country", "Ünïcode \"quoted\"")
            .with("tags", json!(["b", "a"]));
        let parsed = MetricMetadata::from_json(&meta.canonical_json()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_identity_key_distinguishes_project_and_metadata() {
        let base = NormalizedMetric::new("revenue", 10.0, feb_first());
        let with_project = base.clone().with_project("app-1", None);
        let de = base
            .clone()
            .with_metadata(MetricMetadata::new().with("country", "DE"));
        let fr = base
            .clone()
            .with_metadata(MetricMetadata::new().with("country", "FR"));

        let keys = [
            base.identity_key("a"),
            with_project.identity_key("a"),
            de.identity_key("a"),
            fr.identity_key("a"),
        ];
        for (i, k1) in keys.iter().enumerate() {
            for k2 in keys.iter().skip(i + 1) {
                assert_ne!(k1, k2);
            }
        }

        // Value, currency and pending flag are not part of the key.
        let other_value = NormalizedMetric::new("revenue", 99.0, feb_first())
            .with_currency("EUR")
            .pending();
        assert_eq!(base.identity_key("a"), other_value.identity_key("a"));
    }

    #[test]
    fn test_metric_deserializes_from_provider_json() {
        let metric: NormalizedMetric = serde_json::from_value(json!({
            "metricType": "mrr",
            "value": 4200.5,
            "date": "2026-02-01",
            "currency": "USD",
            "metadata": {"country": "US"}
        }))
        .unwrap();

        assert_eq!(metric.metric_type, "mrr");
        assert_eq!(metric.date, feb_first());
        assert!(!metric.pending);
        assert_eq!(metric.metadata.get("country"), Some(&json!("US")));
    }
}
