//! # Data Fetcher Contract
//!
//! The seam between the orchestrator and provider adapters.
//!
//! ## Call Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncOrchestrator                        DataFetcher (per provider)    │
//! │  ────────────────                        ──────────────────────────    │
//! │                                                                         │
//! │  FetchRequest {                                                        │
//! │    account, credentials,      ───────►   sync(request, reporter)       │
//! │    since, full_resync                        │                          │
//! │  }                                           │  per phase:              │
//! │                                              │  reporter.report(step)   │
//! │  StepReporter  ◄─────────────────────────────┘  (running → done)        │
//! │  (progress tracker)                                                     │
//! │                                                                         │
//! │  FetchOutcome {               ◄───────   Ok(outcome) / Err(FetchError) │
//! │    success, records_processed,                                          │
//! │    metrics, steps, error                                                │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Outcome Semantics
//! - Every phase succeeded: `success = true`, `error = None`
//! - Some phases failed: `success = true`, `error` summarizes the failures,
//!   the failed steps are in `steps`, metrics from the good phases are kept
//! - Every attempted phase failed: `success = false`, nothing is stored
//!
//! Adapters get these semantics for free by running their phases through a
//! [`PhaseRecorder`].

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::debug;

use tally_core::{Account, Credentials, NormalizedMetric, StepStatus, SyncStep};

// =============================================================================
// Fetch Error
// =============================================================================

/// Errors raised by provider adapters.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The provider rejected the credentials (401/403).
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The credential map is missing fields the adapter needs.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The provider throttled us.
    #[error("Rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Transport failure before a response arrived.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with an error status.
    #[error("Provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    /// The response could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Local I/O (e.g. reading an export file).
    #[error("I/O error: {0}")]
    Io(String),
}

impl FetchError {
    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::RateLimited { .. } | FetchError::Network(_) => true,
            FetchError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::InvalidResponse(err.to_string())
    }
}

// =============================================================================
// Request / Outcome
// =============================================================================

/// Everything an adapter needs for one sync attempt.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub account: &'a Account,
    pub credentials: &'a Credentials,
    /// Incremental cursor; `None` means the adapter's default lookback.
    pub since: Option<DateTime<Utc>>,
    /// Ignore any cursor and fetch full history.
    pub full_resync: bool,
}

impl FetchRequest<'_> {
    /// First metric date the adapter needs to return, if bounded.
    pub fn since_date(&self) -> Option<NaiveDate> {
        if self.full_resync {
            return None;
        }
        self.since.map(|since| since.date_naive())
    }
}

/// What an adapter hands back from [`DataFetcher::sync`].
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub success: bool,
    pub records_processed: u64,
    pub metrics: Vec<NormalizedMetric>,
    pub steps: Vec<SyncStep>,
    /// Total-failure reason, or the partial-failure summary.
    pub error: Option<String>,
}

impl FetchOutcome {
    /// A clean success.
    pub fn succeeded(metrics: Vec<NormalizedMetric>) -> Self {
        FetchOutcome {
            success: true,
            records_processed: metrics.len() as u64,
            metrics,
            steps: Vec::new(),
            error: None,
        }
    }

    /// A total failure.
    pub fn failed(error: impl Into<String>) -> Self {
        FetchOutcome {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_steps(mut self, steps: Vec<SyncStep>) -> Self {
        self.steps = steps;
        self
    }

    /// Succeeded overall but at least one phase failed.
    pub fn is_partial(&self) -> bool {
        self.success && self.error.is_some()
    }
}

// =============================================================================
// Step Reporter
// =============================================================================

/// Receives phase updates while a fetch is running.
///
/// Reports with the same `key` replace each other; the orchestrator's
/// implementation forwards them to the progress tracker.
pub trait StepReporter: Send + Sync {
    fn report(&self, step: SyncStep);
}

/// Reporter that drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReporter;

impl StepReporter for NoOpReporter {
    fn report(&self, _step: SyncStep) {}
}

// =============================================================================
// Data Fetcher
// =============================================================================

/// A provider adapter.
///
/// Implementations are registered once at startup in a
/// [`FetcherRegistry`](crate::registry::FetcherRegistry).
#[async_trait]
pub trait DataFetcher: Send + Sync {
    /// Stable provider id stored on accounts (e.g. "file_import").
    fn provider_id(&self) -> &str;

    /// Human-readable provider name.
    fn display_name(&self) -> &str {
        self.provider_id()
    }

    /// Fetches metrics for one account.
    ///
    /// `Err` is treated like a total failure by the orchestrator.
    async fn sync(
        &self,
        request: FetchRequest<'_>,
        reporter: &dyn StepReporter,
    ) -> Result<FetchOutcome, FetchError>;

    /// Cheap check that the credentials are usable.
    async fn validate_credentials(&self, credentials: &Credentials) -> Result<bool, FetchError>;
}

// =============================================================================
// Phase Recorder
// =============================================================================

/// Runs an adapter's phases and derives its [`FetchOutcome`].
///
/// ```rust,ignore
/// let mut phases = PhaseRecorder::new(reporter);
/// phases.collect("revenue", "Fetch revenue", self.fetch_revenue(&request)).await;
/// phases.collect("customers", "Fetch customers", self.fetch_customers(&request)).await;
/// Ok(phases.finish())
/// ```
pub struct PhaseRecorder<'r> {
    reporter: &'r dyn StepReporter,
    steps: Vec<SyncStep>,
    metrics: Vec<NormalizedMetric>,
    records_processed: u64,
    failures: Vec<String>,
}

impl<'r> PhaseRecorder<'r> {
    pub fn new(reporter: &'r dyn StepReporter) -> Self {
        PhaseRecorder {
            reporter,
            steps: Vec::new(),
            metrics: Vec::new(),
            records_processed: 0,
            failures: Vec::new(),
        }
    }

    /// Runs one phase that yields a value and the number of records it handled.
    ///
    /// Returns `None` if the phase failed; the failure is recorded.
    pub async fn run<T, Fut>(&mut self, key: &str, label: &str, phase: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<(T, u64), FetchError>>,
    {
        let running = SyncStep::running(key, label);
        self.record(running.clone());

        let started = Instant::now();
        let result = phase.await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok((value, records)) => {
                debug!(step = %key, records, elapsed_ms, "Phase succeeded");
                self.records_processed += records;
                self.record(running.succeeded(records, elapsed_ms));
                Some(value)
            }
            Err(err) => {
                debug!(step = %key, error = %err, elapsed_ms, "Phase failed");
                self.failures.push(format!("{}: {}", label, err));
                self.record(running.failed(err.to_string(), elapsed_ms));
                None
            }
        }
    }

    /// Runs a phase that produces metrics and keeps them.
    ///
    /// Returns true if the phase succeeded.
    pub async fn collect<Fut>(&mut self, key: &str, label: &str, phase: Fut) -> bool
    where
        Fut: Future<Output = Result<Vec<NormalizedMetric>, FetchError>>,
    {
        let counted = async move {
            let metrics = phase.await?;
            let count = metrics.len() as u64;
            Ok::<_, FetchError>((metrics, count))
        };

        match self.run(key, label, counted).await {
            Some(metrics) => {
                self.metrics.extend(metrics);
                true
            }
            None => false,
        }
    }

    /// Records a phase that was not attempted.
    pub fn skip(&mut self, key: &str, label: &str, reason: Option<String>) {
        self.record(SyncStep::running(key, label).skipped(reason));
    }

    /// Adds metrics produced outside [`collect`](Self::collect).
    pub fn extend_metrics(&mut self, metrics: impl IntoIterator<Item = NormalizedMetric>) {
        self.metrics.extend(metrics);
    }

    pub fn steps(&self) -> &[SyncStep] {
        &self.steps
    }

    /// Derives the outcome from the recorded phases.
    pub fn finish(self) -> FetchOutcome {
        let attempted = self
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Success | StepStatus::Error))
            .count();
        let failed = self.failures.len();

        if failed == 0 {
            return FetchOutcome {
                success: true,
                records_processed: self.records_processed,
                metrics: self.metrics,
                steps: self.steps,
                error: None,
            };
        }

        let summary = format!(
            "{} of {} phases failed: {}",
            failed,
            attempted,
            self.failures.join("; ")
        );

        if failed == attempted {
            FetchOutcome::failed(summary).with_steps(self.steps)
        } else {
            FetchOutcome {
                success: true,
                records_processed: self.records_processed,
                metrics: self.metrics,
                steps: self.steps,
                error: Some(summary),
            }
        }
    }

    fn record(&mut self, step: SyncStep) {
        self.reporter.report(step.clone());
        tally_core::upsert_step(&mut self.steps, step);
    }
}
