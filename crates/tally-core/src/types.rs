//! # Domain Types
//!
//! Core domain types used throughout Tally.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Account      │   │    Project      │   │    SyncLog      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │◄──│  account_id     │   │  account_id     │       │
//! │  │  provider_id    │   │  id (provider)  │   │  status         │       │
//! │  │  encrypted_...  │   │  label          │   │  started_at     │       │
//! │  │  is_active      │   │  filters        │   │  completed_at   │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  SyncProgress   │   │    SyncStep     │   │   SyncStatus    │       │
//! │  │  (in-memory)    │──►│  key, label     │   │  Running        │       │
//! │  │  steps[]        │   │  status         │   │  Success        │       │
//! │  │  status         │   │  records, ms    │   │  Error          │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Metrics live in [`crate::metric`] because their identity rules need more room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Sync Status
// =============================================================================

/// Status of one orchestration attempt, shared by durable logs and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Attempt in flight.
    Running,
    /// Fetch and store completed (possibly with a partial-failure summary).
    Success,
    /// Attempt failed; nothing from it was stored.
    Error,
}

impl SyncStatus {
    /// Returns the lowercase storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    /// Returns true once the attempt can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            other => Err(CoreError::UnknownStatus {
                kind: "sync",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Account
// =============================================================================

/// An authenticated connection to one external provider.
///
/// Credentials never appear here in clear text; `encrypted_credentials` holds
/// the vault record (or, during migration, legacy plaintext JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Account {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Which adapter talks to this account (e.g. "file_import").
    pub provider_id: String,

    /// Display label chosen by the user.
    pub label: String,

    /// Vault record for the credential JSON.
    #[serde(skip_serializing)]
    pub encrypted_credentials: String,

    /// Inactive accounts are skipped by syncs but keep their history.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Project
// =============================================================================

/// A narrower slice of an account (one product, one app, ...).
///
/// Created by the metric store the first time a metric references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Project {
    pub account_id: String,

    /// Provider-side identifier, unique within the account.
    pub id: String,

    pub label: String,

    /// JSON object with display filters; `{}` when auto-created.
    pub filters: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Log
// =============================================================================

/// Append-only record of one orchestration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncLog {
    pub id: String,
    pub account_id: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sanitized error text. Set on `error`, and on `success` after a partial failure.
    pub error: Option<String>,
    pub records_processed: i64,
}

impl SyncLog {
    /// Returns true if this `running` row has outlived `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == SyncStatus::Running && now - self.started_at >= stale_after
    }
}

// =============================================================================
// Sync Step
// =============================================================================

/// Status of one fetch phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Error,
    Skipped,
}

/// One discrete phase reported by a fetcher (e.g. "fetch products").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStep {
    /// Stable key; a later report with the same key replaces this one.
    pub key: String,
    pub label: String,
    pub status: StepStatus,
    #[ts(type = "number")]
    pub records: u64,
    #[ts(type = "number | null")]
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl SyncStep {
    /// A phase that just started.
    pub fn running(key: impl Into<String>, label: impl Into<String>) -> Self {
        SyncStep {
            key: key.into(),
            label: label.into(),
            status: StepStatus::Running,
            records: 0,
            duration_ms: None,
            error: None,
        }
    }

    /// Marks the phase finished successfully.
    pub fn succeeded(mut self, records: u64, duration_ms: u64) -> Self {
        self.status = StepStatus::Success;
        self.records = records;
        self.duration_ms = Some(duration_ms);
        self.error = None;
        self
    }

    /// Marks the phase failed.
    pub fn failed(mut self, error: impl Into<String>, duration_ms: u64) -> Self {
        self.status = StepStatus::Error;
        self.duration_ms = Some(duration_ms);
        self.error = Some(error.into());
        self
    }

    /// Marks the phase skipped (e.g. feature not enabled on the account).
    pub fn skipped(mut self, reason: Option<String>) -> Self {
        self.status = StepStatus::Skipped;
        self.duration_ms = Some(0);
        self.error = reason;
        self
    }
}

// =============================================================================
// Sync Progress
// =============================================================================

/// Ephemeral progress of an in-flight or just-finished sync, for UI polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub account_id: String,
    pub status: SyncStatus,
    pub steps: Vec<SyncStep>,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncProgress {
    /// Fresh `running` progress with no steps.
    pub fn start(account_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        SyncProgress {
            account_id: account_id.into(),
            status: SyncStatus::Running,
            steps: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Appends `step`, or replaces the existing step with the same key in place.
    pub fn upsert_step(&mut self, step: SyncStep, now: DateTime<Utc>) {
        upsert_step(&mut self.steps, step);
        self.updated_at = now;
    }

    /// Sets the terminal status.
    pub fn finalize(&mut self, status: SyncStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// Appends `step` to `steps` or replaces the entry with the same key in place.
pub fn upsert_step(steps: &mut Vec<SyncStep>, step: SyncStep) {
    match steps.iter_mut().find(|s| s.key == step.key) {
        Some(existing) => *existing = step,
        None => steps.push(step),
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Decrypted credential map handed to a fetcher (e.g. `{"apiKey": "..."}`).
///
/// `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(serde_json::Map<String, serde_json::Value>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a string field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Returns a string field, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.0
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Credentials {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Credentials(map)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
