//! End-to-end tests for the sync orchestrator against an in-memory database
//! and scripted provider adapters.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Notify;

use tally_core::{
    Account, Credentials, MetricMetadata, NormalizedMetric, StepStatus, SyncLog, SyncStatus,
    STALE_SYNC_MESSAGE,
};
use tally_db::{Database, DbConfig};
use tally_sync::vault::KEY_LENGTH;
use tally_sync::{
    CredentialVault, DataFetcher, FetchError, FetchOutcome, FetchRequest, FetcherRegistry,
    OrchestratorSettings, PhaseRecorder, StepReporter, SyncError, SyncOptions, SyncOrchestrator,
};

// =============================================================================
// Scripted Fetcher
// =============================================================================

type Phase = (&'static str, Result<Vec<NormalizedMetric>, String>);

#[derive(Clone)]
enum Behavior {
    Return(FetchOutcome),
    Phased(Vec<Phase>),
    Fail(String),
    Panic,
    Block {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        outcome: FetchOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Seen {
    since: Option<DateTime<Utc>>,
    full_resync: bool,
}

struct ScriptedFetcher {
    provider_id: &'static str,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    seen: Mutex<Vec<Seen>>,
}

impl ScriptedFetcher {
    fn new(provider_id: &'static str, fallback: Behavior) -> Self {
        ScriptedFetcher {
            provider_id,
            script: Mutex::new(VecDeque::new()),
            fallback,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn then(self, behavior: Behavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    fn next(&self) -> Behavior {
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataFetcher for ScriptedFetcher {
    fn provider_id(&self) -> &str {
        self.provider_id
    }

    async fn sync(
        &self,
        request: FetchRequest<'_>,
        reporter: &dyn StepReporter,
    ) -> Result<FetchOutcome, FetchError> {
        let seen = Seen {
            since: request.since,
            full_resync: request.full_resync,
        };
        self.seen.lock().unwrap().push(seen);
        let behavior = self.next();

        match behavior {
            Behavior::Return(outcome) => Ok(outcome),
            Behavior::Phased(phases) => {
                let mut recorder = PhaseRecorder::new(reporter);
                for (key, result) in phases {
                    recorder
                        .collect(key, key, async move { result.map_err(FetchError::Network) })
                        .await;
                }
                Ok(recorder.finish())
            }
            Behavior::Fail(message) => Err(FetchError::Auth(message)),
            Behavior::Panic => panic!("adapter exploded"),
            Behavior::Block {
                entered,
                release,
                outcome,
            } => {
                entered.notify_one();
                release.notified().await;
                Ok(outcome)
            }
        }
    }

    async fn validate_credentials(&self, _credentials: &Credentials) -> Result<bool, FetchError> {
        Ok(true)
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    db: Database,
    vault: Arc<CredentialVault>,
    registry: Arc<FetcherRegistry>,
    orchestrator: SyncOrchestrator,
}

impl Harness {
    async fn new(fetchers: Vec<Arc<ScriptedFetcher>>) -> Self {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let vault = Arc::new(CredentialVault::from_key(&[9u8; KEY_LENGTH]).unwrap());

        let mut registry = FetcherRegistry::with_builtin();
        for fetcher in fetchers {
            registry.register(fetcher);
        }
        let registry = Arc::new(registry);

        let orchestrator = SyncOrchestrator::new(db.clone(), vault.clone(), registry.clone());
        Harness {
            db,
            vault,
            registry,
            orchestrator,
        }
    }

    /// A second orchestrator over the same database (another process).
    fn other_orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(self.db.clone(), self.vault.clone(), self.registry.clone())
    }

    async fn add_account(&self, id: &str, provider_id: &str) -> String {
        let credentials = Credentials::new().with("apiKey", "sk_test_0123456789");
        self.add_account_with(id, provider_id, &credentials).await
    }

    async fn add_account_with(
        &self,
        id: &str,
        provider_id: &str,
        credentials: &Credentials,
    ) -> String {
        let now = Utc::now();
        self.db
            .accounts()
            .insert(&Account {
                id: id.to_string(),
                provider_id: provider_id.to_string(),
                label: format!("{} label", id),
                encrypted_credentials: self.vault.encrypt_credentials(credentials).unwrap(),
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        id.to_string()
    }

    async fn insert_log(
        &self,
        account_id: &str,
        status: SyncStatus,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> String {
        let log = SyncLog {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            status,
            started_at,
            completed_at,
            error: None,
            records_processed: 0,
        };
        self.db.sync_logs().insert(&log).await.unwrap();
        log.id
    }

    async fn metric_count(&self, account_id: &str) -> i64 {
        self.db.metrics().count_for_account(account_id).await.unwrap()
    }
}

fn feb(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, day).unwrap()
}

fn revenue(value: f64) -> NormalizedMetric {
    NormalizedMetric::new("revenue", value, feb(1)).with_currency("USD")
}

fn returns(metrics: Vec<NormalizedMetric>) -> Behavior {
    Behavior::Return(FetchOutcome::succeeded(metrics))
}

fn scripted(fallback: Behavior) -> Arc<ScriptedFetcher> {
    Arc::new(ScriptedFetcher::new("scripted", fallback))
}

// =============================================================================
// Storage Semantics
// =============================================================================

#[tokio::test]
async fn test_sync_is_idempotent() {
    let fetcher = scripted(returns(vec![
        revenue(10.0),
        NormalizedMetric::new("mrr", 5.0, feb(1)),
    ]));
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let first = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert!(first.is_success());
    assert_eq!(first.records_processed, 2);
    assert_eq!(first.stored.inserted, 2);

    let second = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert_eq!(second.stored.inserted, 0);
    assert_eq!(second.stored.updated, 2);
    assert_eq!(h.metric_count(&account).await, 2);

    let log = h.db.sync_logs().get_by_id(&first.log_id).await.unwrap().unwrap();
    assert_eq!(log.status, SyncStatus::Success);
    assert_eq!(log.records_processed, 2);
    assert!(log.error.is_none());
    assert!(log.completed_at.is_some());
}

#[tokio::test]
async fn test_dedup_separates_projects_and_metadata() {
    let country = |code: &str| MetricMetadata::new().with("country", code);
    let fetcher = scripted(returns(vec![
        revenue(10.0),
        revenue(4.0).with_project("app-1", None),
        revenue(3.0).with_metadata(country("DE")),
        revenue(2.0).with_metadata(country("US")),
        revenue(7.0).with_metadata(country("DE")),
    ]));
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.stored.inserted, 4);
    assert_eq!(report.stored.updated, 1);
    assert_eq!(report.stored.projects_created, 1);
    assert_eq!(h.metric_count(&account).await, 4);

    let de = revenue(0.0)
        .with_metadata(country("DE"))
        .identity_key(&account);
    let rows = h.db.metrics().find_by_key(&de).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, 7.0);

    let projects = h.db.projects().list_for_account(&account).await.unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].label, "app-1");
}

#[tokio::test]
async fn test_pending_then_final_value() {
    let fetcher = Arc::new(
        ScriptedFetcher::new("scripted", returns(vec![revenue(7.0)]))
            .then(returns(vec![revenue(5.0).pending()]))
            .then(returns(vec![revenue(6.0).pending()])),
    );
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;
    let options = SyncOptions::incremental();

    let first = h.orchestrator.sync_account(&account, options).await.unwrap();
    assert_eq!(first.stored.inserted, 1);

    let second = h.orchestrator.sync_account(&account, options).await.unwrap();
    assert_eq!(second.stored.pending_replaced, 1);
    assert_eq!(h.metric_count(&account).await, 1);

    let last = h.orchestrator.sync_account(&account, options).await.unwrap();
    assert_eq!(last.stored.updated, 1);

    let rows = h
        .db
        .metrics()
        .list_range(&account, feb(1), feb(1), Some("revenue"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, 7.0);
}

#[tokio::test]
async fn test_invalid_metrics_are_dropped() {
    let fetcher = scripted(returns(vec![
        revenue(1.0),
        NormalizedMetric::new("Bad Type", 1.0, feb(1)),
        NormalizedMetric::new("mrr", f64::NAN, feb(1)),
    ]));
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.rejected_metrics, 2);
    assert_eq!(report.stored.inserted, 1);
    assert_eq!(h.metric_count(&account).await, 1);
}

#[tokio::test]
async fn test_small_chunks_store_everything() {
    let metrics: Vec<_> = (1..=5)
        .map(|day| NormalizedMetric::new("revenue", f64::from(day), feb(day)))
        .collect();
    let h = Harness::new(vec![scripted(returns(metrics))]).await;
    let account = h.add_account("acct", "scripted").await;

    let orchestrator = h.orchestrator.clone().with_settings(OrchestratorSettings {
        chunk_size: 2,
        ..OrchestratorSettings::default()
    });
    let report = orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.stored.inserted, 5);
    assert_eq!(h.metric_count(&account).await, 5);
}

// =============================================================================
// Failure Handling
// =============================================================================

#[tokio::test]
async fn test_partial_failure_is_success_with_summary() {
    let fetcher = scripted(Behavior::Phased(vec![
        ("revenue", Ok(vec![revenue(10.0)])),
        (
            "customers",
            Err("HTTP 500 api_key=sk_live_abcdefgh12345".to_string()),
        ),
    ]));
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert!(report.is_partial());
    let summary = report.error.as_deref().unwrap();
    assert!(summary.starts_with("1 of 2 phases failed"));
    assert!(!summary.contains("abcdefgh12345"));
    assert_eq!(h.metric_count(&account).await, 1);

    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].status, StepStatus::Success);
    assert_eq!(report.steps[1].status, StepStatus::Error);
    assert!(!report.steps[1].error.as_deref().unwrap().contains("abcdefgh12345"));

    let log = h.db.sync_logs().get_by_id(&report.log_id).await.unwrap().unwrap();
    assert_eq!(log.status, SyncStatus::Success);
    assert_eq!(log.error.as_deref(), Some(summary));

    let progress = h.orchestrator.progress(&account).unwrap();
    assert_eq!(progress.status, SyncStatus::Success);
    assert_eq!(progress.steps, report.steps);
    assert!(progress.completed_at.is_some());
}

#[tokio::test]
async fn test_total_failure_stores_nothing() {
    let fetcher = scripted(Behavior::Phased(vec![
        ("revenue", Err("timeout".to_string())),
        ("customers", Err("timeout".to_string())),
    ]));
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Error);
    assert_eq!(report.records_processed, 0);
    assert!(report.error.unwrap().starts_with("2 of 2 phases failed"));
    assert_eq!(h.metric_count(&account).await, 0);

    let log = h.db.sync_logs().get_by_id(&report.log_id).await.unwrap().unwrap();
    assert_eq!(log.status, SyncStatus::Error);
    assert_eq!(log.records_processed, 0);
    assert_eq!(
        h.orchestrator.progress(&account).unwrap().status,
        SyncStatus::Error
    );
}

#[tokio::test]
async fn test_corrupt_export_keeps_cursor() {
    let h = Harness::new(vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("export.json");
    let credentials = Credentials::new().with("path", export.to_string_lossy());
    let account = h.add_account_with("acct", "file_import", &credentials).await;

    let at = |text: &str| text.parse::<DateTime<Utc>>().unwrap();
    h.insert_log(
        &account,
        SyncStatus::Success,
        at("2026-01-01T00:00:00Z"),
        Some(at("2026-01-01T00:05:00Z")),
    )
    .await;

    std::fs::write(&export, "not json").unwrap();
    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Error);
    assert!(report.error.unwrap().contains("Import metrics"));
    assert_eq!(h.metric_count(&account).await, 0);

    // Once the file is fixed, metrics after the old cursor still arrive.
    std::fs::write(
        &export,
        r#"[{"metricType": "revenue", "value": 42, "date": "2026-02-01", "currency": "USD"}]"#,
    )
    .unwrap();
    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Success);
    assert_eq!(report.cursor, Some(at("2026-01-01T00:05:00Z")));
    assert_eq!(report.stored.inserted, 1);
    assert_eq!(h.metric_count(&account).await, 1);
}

#[tokio::test]
async fn test_fetcher_error_is_recorded_and_redacted() {
    let fetcher = scripted(Behavior::Fail("token=abc123secret rejected".into()));
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Error);
    let error = report.error.unwrap();
    assert!(error.contains("Authentication failed"));
    assert!(!error.contains("abc123secret"));

    let log = h.db.sync_logs().get_by_id(&report.log_id).await.unwrap().unwrap();
    assert_eq!(log.error.as_deref(), Some(error.as_str()));
}

#[tokio::test]
async fn test_fetcher_panic_becomes_error_and_releases_guard() {
    let fetcher = Arc::new(
        ScriptedFetcher::new("scripted", returns(vec![revenue(1.0)])).then(Behavior::Panic),
    );
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert_eq!(report.status, SyncStatus::Error);
    assert!(report.error.unwrap().contains("adapter exploded"));
    assert!(!h.orchestrator.is_running(&account));

    let retry = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert!(retry.is_success());
}

#[tokio::test]
async fn test_unknown_provider_is_attempt_failure() {
    let h = Harness::new(vec![scripted(returns(vec![]))]).await;
    let account = h.add_account("acct", "retired_provider").await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Error);
    assert!(report.error.unwrap().contains("Unknown provider"));
}

// =============================================================================
// Preconditions
// =============================================================================

#[tokio::test]
async fn test_missing_and_inactive_accounts_write_nothing() {
    let h = Harness::new(vec![scripted(returns(vec![]))]).await;
    let account = h.add_account("acct", "scripted").await;
    h.db.accounts().set_active(&account, false).await.unwrap();

    let err = h
        .orchestrator
        .sync_account("missing", SyncOptions::incremental())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AccountNotFound(_)));

    let err = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AccountInactive(_)));
    assert!(err.is_precondition());

    assert!(h.db.sync_logs().list_recent(&account, 10).await.unwrap().is_empty());
    assert!(h.orchestrator.progress(&account).is_none());
}

#[tokio::test]
async fn test_second_attempt_in_process_is_rejected() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let fetcher = scripted(Behavior::Block {
        entered: entered.clone(),
        release: release.clone(),
        outcome: FetchOutcome::succeeded(vec![revenue(1.0)]),
    });
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        let account = account.clone();
        async move {
            orchestrator
                .sync_account(&account, SyncOptions::incremental())
                .await
        }
    });
    entered.notified().await;

    assert!(h.orchestrator.is_running(&account));
    assert_eq!(
        h.orchestrator.progress(&account).unwrap().status,
        SyncStatus::Running
    );

    let err = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning(_)));
    assert_eq!(h.db.sync_logs().find_running(&account).await.unwrap().len(), 1);

    release.notify_one();
    let report = first.await.unwrap().unwrap();
    assert!(report.is_success());
    assert!(!h.orchestrator.is_running(&account));
    assert!(h.db.sync_logs().find_running(&account).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_running_row_blocks_other_orchestrators() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let fetcher = scripted(Behavior::Block {
        entered: entered.clone(),
        release: release.clone(),
        outcome: FetchOutcome::succeeded(vec![]),
    });
    let h = Harness::new(vec![fetcher]).await;
    let account = h.add_account("acct", "scripted").await;

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        let account = account.clone();
        async move {
            orchestrator
                .sync_account(&account, SyncOptions::incremental())
                .await
        }
    });
    entered.notified().await;

    let err = h
        .other_orchestrator()
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning(_)));

    let running = h.db.sync_logs().find_running(&account).await.unwrap();
    assert_eq!(running.len(), 1);
    assert!(running[0].error.is_none());

    release.notify_one();
    assert!(first.await.unwrap().unwrap().is_success());
}

#[tokio::test]
async fn test_stale_running_row_is_finalized() {
    let h = Harness::new(vec![scripted(returns(vec![revenue(1.0)]))]).await;
    let account = h.add_account("acct", "scripted").await;

    let stale_id = h
        .insert_log(
            &account,
            SyncStatus::Running,
            Utc::now() - chrono::Duration::minutes(11),
            None,
        )
        .await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert!(report.is_success());

    let stale = h.db.sync_logs().get_by_id(&stale_id).await.unwrap().unwrap();
    assert_eq!(stale.status, SyncStatus::Error);
    assert_eq!(stale.error.as_deref(), Some(STALE_SYNC_MESSAGE));
    assert!(stale.completed_at.is_some());
    assert!(h.db.sync_logs().find_running(&account).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_row_wins_over_stale_rows() {
    let h = Harness::new(vec![scripted(returns(vec![]))]).await;
    let account = h.add_account("acct", "scripted").await;
    let now = Utc::now();

    let stale_id = h
        .insert_log(&account, SyncStatus::Running, now - chrono::Duration::minutes(30), None)
        .await;
    h.insert_log(&account, SyncStatus::Running, now - chrono::Duration::minutes(1), None)
        .await;

    let err = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning(_)));

    // Nothing is repaired while another attempt may still be live.
    let stale = h.db.sync_logs().get_by_id(&stale_id).await.unwrap().unwrap();
    assert_eq!(stale.status, SyncStatus::Running);
}

#[tokio::test]
async fn test_staleness_window_is_configurable() {
    let h = Harness::new(vec![scripted(returns(vec![]))]).await;
    let account = h.add_account("acct", "scripted").await;
    h.insert_log(
        &account,
        SyncStatus::Running,
        Utc::now() - chrono::Duration::minutes(2),
        None,
    )
    .await;

    let strict = h.orchestrator.clone().with_settings(OrchestratorSettings {
        stale_after: Duration::from_secs(60),
        ..OrchestratorSettings::default()
    });
    assert!(strict
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap()
        .is_success());
}

// =============================================================================
// Cursors
// =============================================================================

#[tokio::test]
async fn test_cursor_selection() {
    let fetcher = scripted(returns(vec![]));
    let h = Harness::new(vec![fetcher.clone()]).await;
    let account = h.add_account("acct", "scripted").await;

    // No prior success: adapter default lookback.
    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert_eq!(report.cursor, None);
    assert_eq!(
        fetcher.seen()[0],
        Seen {
            since: None,
            full_resync: false
        }
    );

    // Latest success, with an older one and a newer failure around it.
    h.db.sync_logs()
        .prune_finished_before(Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    let at = |text: &str| text.parse::<DateTime<Utc>>().unwrap();
    h.insert_log(
        &account,
        SyncStatus::Success,
        at("2026-01-01T00:00:00Z"),
        Some(at("2026-01-01T00:05:00Z")),
    )
    .await;
    h.insert_log(
        &account,
        SyncStatus::Success,
        at("2026-01-31T23:58:00Z"),
        Some(at("2026-02-01T00:00:00Z")),
    )
    .await;
    h.insert_log(
        &account,
        SyncStatus::Error,
        at("2026-02-02T00:00:00Z"),
        Some(at("2026-02-02T00:01:00Z")),
    )
    .await;

    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert_eq!(report.cursor, Some(at("2026-02-01T00:00:00Z")));
    assert_eq!(fetcher.seen()[1].since, Some(at("2026-02-01T00:00:00Z")));

    // Full resync ignores every cursor.
    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::full_resync())
        .await
        .unwrap();
    assert_eq!(report.cursor, None);
    assert!(report.full_resync);
    assert_eq!(
        fetcher.seen()[2],
        Seen {
            since: None,
            full_resync: true
        }
    );

    // An explicit start date wins over the last success.
    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::since(at("2026-01-15T00:00:00Z")))
        .await
        .unwrap();
    assert_eq!(report.cursor, Some(at("2026-01-15T00:00:00Z")));

    // The sync that just finished is now the cursor.
    let report = h
        .orchestrator
        .sync_account(&account, SyncOptions::incremental())
        .await
        .unwrap();
    assert!(report.cursor.unwrap() > at("2026-02-01T00:00:00Z"));
}

// =============================================================================
// All Accounts
// =============================================================================

#[tokio::test]
async fn test_sync_all_continues_past_failures() {
    let good = scripted(returns(vec![revenue(1.0)]));
    let broken = Arc::new(ScriptedFetcher::new(
        "broken",
        Behavior::Fail("credentials revoked".into()),
    ));
    let h = Harness::new(vec![good, broken]).await;

    let ok = h.add_account("ok", "scripted").await;
    let failing = h.add_account("failing", "broken").await;
    let busy = h.add_account("busy", "scripted").await;
    let off = h.add_account("off", "scripted").await;
    h.db.accounts().set_active(&off, false).await.unwrap();
    h.insert_log(&busy, SyncStatus::Running, Utc::now(), None).await;

    let results = h
        .orchestrator
        .sync_all_accounts(SyncOptions::incremental())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    let result_for = |id: &str| results.iter().find(|r| r.account_id == id).unwrap();

    assert!(result_for(&ok).is_success());

    let failed = result_for(&failing);
    assert!(!failed.is_success());
    assert_eq!(
        failed.result.as_ref().unwrap().status,
        SyncStatus::Error
    );

    assert!(matches!(
        result_for(&busy).result,
        Err(SyncError::AlreadyRunning(_))
    ));
    assert_eq!(result_for(&busy).label, "busy label");

    assert!(results.iter().all(|r| r.account_id != off));
    assert_eq!(h.metric_count(&ok).await, 1);
}
