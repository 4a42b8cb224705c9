//! # Validation Module
//!
//! Well-formedness checks for metrics handed back by provider adapters and for
//! account input.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Adapter (provider-specific)                                  │
//! │  └── Deserialization into NormalizedMetric (types, ISO dates)          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Orchestrator                                                 │
//! │  └── THIS MODULE: shape rules every provider must honor                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL constraints                                              │
//! │  └── Foreign key constraints                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::metric::NormalizedMetric;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_METRIC_TYPE_LEN: usize = 64;
const MAX_PROJECT_ID_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 200;

/// Validates a metric type identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Lowercase ASCII letters, digits, `_`, `-`, `.`
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_metric_type;
///
/// assert!(validate_metric_type("active_subscriptions").is_ok());
/// assert!(validate_metric_type("").is_err());
/// assert!(validate_metric_type("Revenue Total").is_err());
/// ```
pub fn validate_metric_type(metric_type: &str) -> ValidationResult<()> {
    if metric_type.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "metric_type".to_string(),
        });
    }

    if metric_type.len() > MAX_METRIC_TYPE_LEN {
        return Err(ValidationError::TooLong {
            field: "metric_type".to_string(),
            max: MAX_METRIC_TYPE_LEN,
        });
    }

    if !metric_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::InvalidFormat {
            field: "metric_type".to_string(),
            reason: "must contain only lowercase letters, digits, '_', '-' and '.'".to_string(),
        });
    }

    Ok(())
}

/// Validates an ISO 4217 currency code (three uppercase ASCII letters).
pub fn validate_currency(currency: &str) -> ValidationResult<()> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: format!("expected a three-letter ISO 4217 code, got '{}'", currency),
        });
    }
    Ok(())
}

/// Validates a human-facing label (account or project).
pub fn validate_label(field: &str, label: &str) -> ValidationResult<()> {
    if label.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if label.chars().count() > MAX_LABEL_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_LABEL_LEN,
        });
    }
    Ok(())
}

/// Validates the full normalized shape of one metric.
///
/// ## Rules
/// - `metric_type` passes [`validate_metric_type`]
/// - `value` is finite
/// - `currency`, when present, is an ISO code
/// - `project_id`, when present, is non-empty and at most 255 characters
pub fn validate_metric(metric: &NormalizedMetric) -> ValidationResult<()> {
    validate_metric_type(&metric.metric_type)?;

    if !metric.value.is_finite() {
        return Err(ValidationError::NotFinite {
            field: "value".to_string(),
        });
    }

    if let Some(ref currency) = metric.currency {
        validate_currency(currency)?;
    }

    if let Some(ref project_id) = metric.project_id {
        if project_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "project_id".to_string(),
            });
        }
        if project_id.len() > MAX_PROJECT_ID_LEN {
            return Err(ValidationError::TooLong {
                field: "project_id".to_string(),
                max: MAX_PROJECT_ID_LEN,
            });
        }
    }

    Ok(())
}

/// Splits a batch into valid metrics and the rejects with their reasons.
pub fn partition_valid(
    metrics: Vec<NormalizedMetric>,
) -> (Vec<NormalizedMetric>, Vec<(NormalizedMetric, ValidationError)>) {
    let mut valid = Vec::with_capacity(metrics.len());
    let mut rejected = Vec::new();
    for metric in metrics {
        match validate_metric(&metric) {
            Ok(()) => valid.push(metric),
            Err(e) => rejected.push((metric, e)),
        }
    }
    (valid, rejected)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn metric(metric_type: &str, value: f64) -> NormalizedMetric {
        NormalizedMetric::new(
            metric_type,
            value,
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
        )
    }

    #[test]
    fn test_validate_metric_type() {
        assert!(validate_metric_type("revenue").is_ok());
        assert!(validate_metric_type("mrr.net-new_2").is_ok());

        assert!(validate_metric_type("").is_err());
        assert!(validate_metric_type("   ").is_err());
        assert!(validate_metric_type("Revenue").is_err());
        assert!(validate_metric_type(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_currency() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("EURO").is_err());
    }

    #[test]
    fn test_validate_metric() {
        assert!(validate_metric(&metric("revenue", 1.5).with_currency("EUR")).is_ok());
        assert!(validate_metric(&metric("revenue", f64::NAN)).is_err());
        assert!(validate_metric(&metric("revenue", f64::INFINITY)).is_err());
        assert!(validate_metric(&metric("revenue", 1.0).with_project("  ", None)).is_err());
    }

    #[test]
    fn test_partition_valid() {
        let (valid, rejected) = partition_valid(vec![
            metric("revenue", 1.0),
            metric("", 2.0),
            metric("mrr", f64::NAN),
        ]);
        assert_eq!(valid.len(), 1);
        assert_eq!(rejected.len(), 2);
        assert!(matches!(rejected[0].1, ValidationError::Required { .. }));
    }

    #[test]
    fn test_validate_label() {
        assert!(validate_label("label", "Main Stripe").is_ok());
        assert!(validate_label("label", "").is_err());
        assert!(validate_label("label", &"x".repeat(201)).is_err());
    }
}
