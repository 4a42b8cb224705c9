//! # Sync Orchestrator
//!
//! Runs one sync attempt per account: guards, cursor, fetch, validate,
//! store, finalize.
//!
//! ## Attempt Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       sync_account(id, options)                         │
//! │                                                                         │
//! │  PRECONDITIONS (Err, nothing written)                                  │
//! │  ─────────────────────────────────────                                  │
//! │  account missing ──────────────► AccountNotFound                       │
//! │  account inactive ─────────────► AccountInactive                       │
//! │  in-process guard held ────────► AlreadyRunning                        │
//! │  fresh `running` log row ──────► AlreadyRunning                        │
//! │  stale `running` log row ──────► finalized as error, continue          │
//! │                                                                         │
//! │  ATTEMPT (always Ok(SyncReport))                                       │
//! │  ───────────────────────────────                                        │
//! │  log row `running` + progress entry                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  cursor ─► fetcher.sync(request, reporter) ─► validate ─► apply_batch  │
//! │       │              │ steps ──► ProgressTracker                        │
//! │       ▼              ▼                                                  │
//! │  any failure is sanitized and recorded                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  log row + progress ──► success (maybe with partial summary) | error   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The fetch runs in its own task so a panicking adapter becomes a recorded
//! `error` instead of taking the caller down.

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use tally_core::redact::sanitize_error;
use tally_core::validation::partition_valid;
use tally_core::{
    Account, SyncLog, SyncProgress, SyncStatus, SyncStep, STALE_SYNC_MESSAGE,
};
use tally_db::{BatchSummary, Database, DEFAULT_CHUNK_SIZE};

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::fetcher::{DataFetcher, FetchOutcome, FetchRequest, StepReporter};
use crate::progress::ProgressTracker;
use crate::registry::FetcherRegistry;
use crate::vault::CredentialVault;

// =============================================================================
// Options / Results
// =============================================================================

/// How far back an attempt should look.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore every cursor and fetch full history.
    pub full_resync: bool,
    /// Explicit cursor; overrides the last successful sync.
    pub start_date: Option<DateTime<Utc>>,
}

impl SyncOptions {
    /// Incremental from the last successful sync.
    pub fn incremental() -> Self {
        Self::default()
    }

    pub fn full_resync() -> Self {
        SyncOptions {
            full_resync: true,
            start_date: None,
        }
    }

    pub fn since(start_date: DateTime<Utc>) -> Self {
        SyncOptions {
            full_resync: false,
            start_date: Some(start_date),
        }
    }
}

/// Result of one attempt that got past its preconditions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub account_id: String,
    pub log_id: String,
    pub status: SyncStatus,
    /// Records the adapter reported processing (0 on failure).
    pub records_processed: u64,
    /// What the metric store did with the valid metrics.
    pub stored: BatchSummary,
    /// Metrics dropped by validation.
    pub rejected_metrics: usize,
    /// Phases in first-report order.
    pub steps: Vec<SyncStep>,
    /// Sanitized failure text, or the partial-failure summary.
    pub error: Option<String>,
    /// Cursor the adapter was given.
    pub cursor: Option<DateTime<Utc>>,
    pub full_resync: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }

    /// Succeeded, but some phases failed.
    pub fn is_partial(&self) -> bool {
        self.is_success() && self.error.is_some()
    }
}

/// One entry of [`SyncOrchestrator::sync_all_accounts`].
#[derive(Debug)]
pub struct AccountSyncResult {
    pub account_id: String,
    pub label: String,
    /// `Err` only for precondition failures (e.g. already running).
    pub result: SyncResult<SyncReport>,
}

impl AccountSyncResult {
    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_ok_and(SyncReport::is_success)
    }
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Age after which a `running` log row no longer blocks new attempts.
    pub stale_after: Duration,
    /// Metrics written per transaction.
    pub chunk_size: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            stale_after: Duration::from_secs(600),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&SyncSettings> for OrchestratorSettings {
    fn from(settings: &SyncSettings) -> Self {
        OrchestratorSettings {
            stale_after: settings.stale_after(),
            chunk_size: settings.chunk_size,
        }
    }
}

impl OrchestratorSettings {
    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }
}

// =============================================================================
// In-Flight Guard
// =============================================================================

type InFlight = Arc<Mutex<HashSet<String>>>;

fn lock_in_flight(set: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds an account's slot in the in-process set; released on drop.
struct InFlightGuard {
    set: InFlight,
    account_id: String,
}

impl InFlightGuard {
    fn acquire(set: &InFlight, account_id: &str) -> Option<Self> {
        if !lock_in_flight(set).insert(account_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(set),
            account_id: account_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_in_flight(&self.set).remove(&self.account_id);
    }
}

// =============================================================================
// Step Reporter
// =============================================================================

/// Forwards steps to the progress tracker and keeps them for the report.
struct TrackingReporter {
    account_id: String,
    progress: ProgressTracker,
    steps: Mutex<Vec<SyncStep>>,
}

impl TrackingReporter {
    fn new(account_id: &str, progress: ProgressTracker) -> Self {
        TrackingReporter {
            account_id: account_id.to_string(),
            progress,
            steps: Mutex::new(Vec::new()),
        }
    }

    fn steps(&self) -> Vec<SyncStep> {
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl StepReporter for TrackingReporter {
    fn report(&self, mut step: SyncStep) {
        step.error = step.error.map(|e| sanitize_error(&e));
        self.progress.upsert_step(&self.account_id, step.clone());

        let mut steps = self
            .steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tally_core::upsert_step(&mut steps, step);
    }
}

// =============================================================================
// Attempt
// =============================================================================

/// Everything the fetch task owns.
struct Attempt {
    db: Database,
    fetcher: Arc<dyn DataFetcher>,
    account: Account,
    credentials: tally_core::Credentials,
    cursor: Option<DateTime<Utc>>,
    full_resync: bool,
    chunk_size: usize,
    reporter: Arc<TrackingReporter>,
}

struct AttemptOutput {
    outcome: FetchOutcome,
    stored: BatchSummary,
    rejected: usize,
}

async fn fetch_and_store(attempt: Attempt) -> SyncResult<AttemptOutput> {
    let request = FetchRequest {
        account: &attempt.account,
        credentials: &attempt.credentials,
        since: attempt.cursor,
        full_resync: attempt.full_resync,
    };

    let mut outcome = attempt
        .fetcher
        .sync(request, attempt.reporter.as_ref())
        .await?;

    // Steps the adapter returned without reporting them live.
    for step in std::mem::take(&mut outcome.steps) {
        attempt.reporter.report(step);
    }

    if !outcome.success {
        return Ok(AttemptOutput {
            outcome,
            stored: BatchSummary::default(),
            rejected: 0,
        });
    }

    let (valid, rejected) = partition_valid(std::mem::take(&mut outcome.metrics));
    for (metric, reason) in &rejected {
        warn!(
            account_id = %attempt.account.id,
            metric_type = %metric.metric_type,
            date = %metric.date,
            reason = %reason,
            "Dropping invalid metric"
        );
    }

    let stored = attempt
        .db
        .metrics()
        .apply_batch(&attempt.account.id, &valid, attempt.chunk_size)
        .await?;

    Ok(AttemptOutput {
        outcome,
        stored,
        rejected: rejected.len(),
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Sync Orchestrator
// =============================================================================

/// Drives syncs for every account. Cloning shares all state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    db: Database,
    vault: Arc<CredentialVault>,
    registry: Arc<FetcherRegistry>,
    progress: ProgressTracker,
    in_flight: InFlight,
    settings: OrchestratorSettings,
}

impl SyncOrchestrator {
    pub fn new(db: Database, vault: Arc<CredentialVault>, registry: Arc<FetcherRegistry>) -> Self {
        SyncOrchestrator {
            db,
            vault,
            registry,
            progress: ProgressTracker::default(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Uses a shared progress tracker (e.g. one the UI layer also reads).
    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Current progress snapshot for the account, if any.
    pub fn progress(&self, account_id: &str) -> Option<SyncProgress> {
        self.progress.get(account_id)
    }

    pub fn progress_tracker(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Returns true while this process is syncing the account.
    pub fn is_running(&self, account_id: &str) -> bool {
        lock_in_flight(&self.in_flight).contains(account_id)
    }

    // =========================================================================
    // Single Account
    // =========================================================================

    /// Runs one sync attempt for the account.
    ///
    /// Returns `Err` only when the attempt could not start; failures during
    /// the attempt are recorded on the sync log and come back as a report
    /// with `status == Error`.
    pub async fn sync_account(
        &self,
        account_id: &str,
        options: SyncOptions,
    ) -> SyncResult<SyncReport> {
        let account = self
            .db
            .accounts()
            .get_by_id(account_id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(account_id.to_string()))?;

        if !account.is_active {
            return Err(SyncError::AccountInactive(account_id.to_string()));
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, account_id)
            .ok_or_else(|| SyncError::AlreadyRunning(account_id.to_string()))?;

        self.check_durable_guard(account_id).await?;

        let started_at = Utc::now();
        let log = self.db.sync_logs().start(account_id, started_at).await?;
        self.progress.start(account_id);

        info!(
            account_id = %account_id,
            provider_id = %account.provider_id,
            log_id = %log.id,
            full_resync = options.full_resync,
            "Sync started"
        );

        let reporter = Arc::new(TrackingReporter::new(account_id, self.progress.clone()));

        let (cursor, result) = match self.resolve_cursor(account_id, &options).await {
            Ok(cursor) => {
                let result = self
                    .run_attempt(&account, cursor, options.full_resync, Arc::clone(&reporter))
                    .await;
                (cursor, result)
            }
            Err(err) => (None, Err(err)),
        };

        Ok(self
            .finalize(&account, &log, cursor, options.full_resync, result, &reporter)
            .await)
    }

    /// Rejects the attempt if a fresh `running` row exists; repairs stale ones.
    async fn check_durable_guard(&self, account_id: &str) -> SyncResult<()> {
        let logs = self.db.sync_logs();
        let running = logs.find_running(account_id).await?;
        let now = Utc::now();
        let stale_after = self.settings.stale_after();

        if running.iter().any(|log| !log.is_stale(now, stale_after)) {
            return Err(SyncError::AlreadyRunning(account_id.to_string()));
        }

        for log in running {
            let repaired = logs
                .finish(
                    &log.id,
                    SyncStatus::Error,
                    Some(STALE_SYNC_MESSAGE),
                    log.records_processed,
                    now,
                )
                .await?;
            if repaired {
                warn!(
                    account_id = %account_id,
                    log_id = %log.id,
                    started_at = %log.started_at,
                    "Finalized stale running sync"
                );
            }
        }

        Ok(())
    }

    async fn resolve_cursor(
        &self,
        account_id: &str,
        options: &SyncOptions,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        if options.full_resync {
            return Ok(None);
        }
        if let Some(start) = options.start_date {
            return Ok(Some(start));
        }

        let last = self.db.sync_logs().latest_success(account_id).await?;
        Ok(last.and_then(|log| log.completed_at))
    }

    async fn run_attempt(
        &self,
        account: &Account,
        cursor: Option<DateTime<Utc>>,
        full_resync: bool,
        reporter: Arc<TrackingReporter>,
    ) -> SyncResult<AttemptOutput> {
        let fetcher = self
            .registry
            .get(&account.provider_id)
            .ok_or_else(|| SyncError::UnknownProvider(account.provider_id.clone()))?;
        let credentials = self.vault.decrypt_credentials(&account.encrypted_credentials)?;

        debug!(account_id = %account.id, cursor = ?cursor, "Invoking fetcher");

        let attempt = Attempt {
            db: self.db.clone(),
            fetcher,
            account: account.clone(),
            credentials,
            cursor,
            full_resync,
            chunk_size: self.settings.chunk_size,
            reporter,
        };

        match tokio::spawn(fetch_and_store(attempt)).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(SyncError::Internal(format!(
                "sync task panicked: {}",
                panic_message(join_err.into_panic())
            ))),
            Err(join_err) => Err(SyncError::Internal(join_err.to_string())),
        }
    }

    /// Writes the terminal state to the log and progress entry.
    async fn finalize(
        &self,
        account: &Account,
        log: &SyncLog,
        cursor: Option<DateTime<Utc>>,
        full_resync: bool,
        result: SyncResult<AttemptOutput>,
        reporter: &TrackingReporter,
    ) -> SyncReport {
        let (status, error, records_processed, stored, rejected) = match result {
            Ok(out) if out.outcome.success => (
                SyncStatus::Success,
                out.outcome.error.as_deref().map(sanitize_error),
                out.outcome.records_processed,
                out.stored,
                out.rejected,
            ),
            Ok(out) => (
                SyncStatus::Error,
                Some(sanitize_error(
                    out.outcome.error.as_deref().unwrap_or("sync failed"),
                )),
                0,
                BatchSummary::default(),
                0,
            ),
            Err(err) => (
                SyncStatus::Error,
                Some(sanitize_error(&err.to_string())),
                0,
                BatchSummary::default(),
                0,
            ),
        };

        let completed_at = Utc::now();
        let records = i64::try_from(records_processed).unwrap_or(i64::MAX);

        match self
            .db
            .sync_logs()
            .finish(&log.id, status, error.as_deref(), records, completed_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(log_id = %log.id, "Sync log was finalized by someone else"),
            Err(err) => error!(
                account_id = %account.id,
                log_id = %log.id,
                error = %err,
                "Failed to finalize sync log"
            ),
        }

        self.progress.finalize(&account.id, status, error.clone());

        match (&status, &error) {
            (SyncStatus::Success, None) => info!(
                account_id = %account.id,
                records_processed,
                inserted = stored.inserted,
                updated = stored.updated,
                "Sync succeeded"
            ),
            (SyncStatus::Success, Some(summary)) => warn!(
                account_id = %account.id,
                records_processed,
                summary = %summary,
                "Sync succeeded with failed phases"
            ),
            (_, error) => warn!(
                account_id = %account.id,
                error = error.as_deref().unwrap_or_default(),
                "Sync failed"
            ),
        }

        SyncReport {
            account_id: account.id.clone(),
            log_id: log.id.clone(),
            status,
            records_processed,
            stored,
            rejected_metrics: rejected,
            steps: reporter.steps(),
            error,
            cursor,
            full_resync,
            started_at: log.started_at,
            completed_at,
        }
    }

    // =========================================================================
    // All Accounts
    // =========================================================================

    /// Syncs every active account, one after another.
    ///
    /// One account's failure, including a precondition error, never stops
    /// the others.
    pub async fn sync_all_accounts(
        &self,
        options: SyncOptions,
    ) -> SyncResult<Vec<AccountSyncResult>> {
        let accounts = self.db.accounts().list_active().await?;
        info!(count = accounts.len(), "Syncing all active accounts");

        let mut results = Vec::with_capacity(accounts.len());
        for account in accounts {
            let result = self.sync_account(&account.id, options).await;
            if let Err(err) = &result {
                warn!(account_id = %account.id, error = %err, "Account sync did not start");
            }

            results.push(AccountSyncResult {
                account_id: account.id,
                label: account.label,
                result,
            });
        }

        Ok(results)
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish()
    }
}
