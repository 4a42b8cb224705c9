//! # Sync Log Repository
//!
//! Append-only history of orchestration attempts. The orchestrator's durable
//! concurrency guard and its incremental cursor are both read from here.
//!
//! ## Row Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   start()  ──► running ──┬── finish(Success) ──► success               │
//! │                          ├── finish(Error)   ──► error                 │
//! │                          └── (process died)                            │
//! │                                 │  older than stale_after              │
//! │                                 ▼                                       │
//! │                          finish(Error, "stale running sync detected")  │
//! │                                                                         │
//! │   latest_success().completed_at ──► next incremental cursor            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{SyncLog, SyncStatus};

const LOG_COLUMNS: &str =
    "id, account_id, status, started_at, completed_at, error, records_processed";

/// Repository for sync log operations.
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    /// Creates a new SyncLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    /// Writes a new `running` row for an attempt that starts at `started_at`.
    pub async fn start(&self, account_id: &str, started_at: DateTime<Utc>) -> DbResult<SyncLog> {
        let log = SyncLog {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            status: SyncStatus::Running,
            started_at,
            completed_at: None,
            error: None,
            records_processed: 0,
        };

        self.insert(&log).await?;
        debug!(account_id = %account_id, log_id = %log.id, "Sync log started");

        Ok(log)
    }

    /// Inserts a log row as-is (used for imports and tests).
    pub async fn insert(&self, log: &SyncLog) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs (
                id, account_id, status, started_at,
                completed_at, error, records_processed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&log.id)
        .bind(&log.account_id)
        .bind(log.status)
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(&log.error)
        .bind(log.records_processed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Moves a `running` row to a terminal status.
    ///
    /// Only `running` rows are touched, so a row that was already finalized
    /// (e.g. repaired as stale by another attempt) keeps its first outcome.
    /// Returns false in that case.
    pub async fn finish(
        &self,
        id: &str,
        status: SyncStatus,
        error: Option<&str>,
        records_processed: i64,
        completed_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        debug!(log_id = %id, status = %status, records_processed, "Finishing sync log");

        let result = sqlx::query(
            r#"
            UPDATE sync_logs
            SET status = ?2, error = ?3, records_processed = ?4, completed_at = ?5
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(records_processed)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_by_id(id).await?.is_none() {
            return Err(DbError::not_found("SyncLog", id));
        }

        Ok(result.rows_affected() > 0)
    }

    /// Gets a log row by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<SyncLog>> {
        let log = sqlx::query_as::<_, SyncLog>(&format!(
            "SELECT {} FROM sync_logs WHERE id = ?1",
            LOG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(log)
    }

    /// Returns the account's `running` rows, newest first.
    pub async fn find_running(&self, account_id: &str) -> DbResult<Vec<SyncLog>> {
        let logs = sqlx::query_as::<_, SyncLog>(&format!(
            r#"
            SELECT {} FROM sync_logs
            WHERE account_id = ?1 AND status = 'running'
            ORDER BY started_at DESC
            "#,
            LOG_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    /// Returns the most recently completed `success` row.
    pub async fn latest_success(&self, account_id: &str) -> DbResult<Option<SyncLog>> {
        let log = sqlx::query_as::<_, SyncLog>(&format!(
            r#"
            SELECT {} FROM sync_logs
            WHERE account_id = ?1 AND status = 'success' AND completed_at IS NOT NULL
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
            LOG_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(log)
    }

    /// Lists the account's most recent attempts, newest first.
    pub async fn list_recent(&self, account_id: &str, limit: u32) -> DbResult<Vec<SyncLog>> {
        let logs = sqlx::query_as::<_, SyncLog>(&format!(
            r#"
            SELECT {} FROM sync_logs
            WHERE account_id = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
            LOG_COLUMNS
        ))
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    /// Deletes finished rows that started before `cutoff`.
    ///
    /// `running` rows are never pruned; they are the durable half of the
    /// concurrency guard.
    pub async fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_logs WHERE status != 'running' AND started_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::repository::test_support::{memory_db, seed_account};

    #[tokio::test]
    async fn test_start_and_finish() {
        let db = memory_db().await;
        let account = seed_account(&db, "file_import").await;
        let logs = db.sync_logs();

        let log = logs.start(&account.id, Utc::now()).await.unwrap();
        assert_eq!(logs.find_running(&account.id).await.unwrap().len(), 1);

        let changed = logs
            .finish(&log.id, SyncStatus::Success, None, 42, Utc::now())
            .await
            .unwrap();
        assert!(changed);

        let stored = logs.get_by_id(&log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Success);
        assert_eq!(stored.records_processed, 42);
        assert!(stored.completed_at.is_some());
        assert!(logs.find_running(&account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_keeps_first_terminal_status() {
        let db = memory_db().await;
        let account = seed_account(&db, "file_import").await;
        let logs = db.sync_logs();

        let log = logs.start(&account.id, Utc::now()).await.unwrap();
        logs.finish(&log.id, SyncStatus::Error, Some("stale"), 0, Utc::now())
            .await
            .unwrap();
        let changed = logs
            .finish(&log.id, SyncStatus::Success, None, 5, Utc::now())
            .await
            .unwrap();

        assert!(!changed);
        let stored = logs.get_by_id(&log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Error);

        assert!(logs
            .finish("missing", SyncStatus::Error, None, 0, Utc::now())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_latest_success_uses_completion_time() {
        let db = memory_db().await;
        let account = seed_account(&db, "file_import").await;
        let logs = db.sync_logs();

        let jan = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        for (completed, status) in [
            (jan, SyncStatus::Success),
            (feb, SyncStatus::Success),
            (feb + Duration::days(1), SyncStatus::Error),
        ] {
            let log = logs.start(&account.id, completed - Duration::minutes(5)).await.unwrap();
            logs.finish(&log.id, status, None, 1, completed).await.unwrap();
        }

        let latest = logs.latest_success(&account.id).await.unwrap().unwrap();
        assert_eq!(latest.completed_at, Some(feb));
    }

    #[tokio::test]
    async fn test_prune_never_removes_running_rows() {
        let db = memory_db().await;
        let account = seed_account(&db, "file_import").await;
        let logs = db.sync_logs();
        let long_ago = Utc::now() - Duration::days(200);

        let finished = logs.start(&account.id, long_ago).await.unwrap();
        logs.finish(&finished.id, SyncStatus::Success, None, 1, long_ago)
            .await
            .unwrap();
        logs.start(&account.id, long_ago).await.unwrap();
        logs.start(&account.id, Utc::now()).await.unwrap();

        let pruned = logs
            .prune_finished_before(Utc::now() - Duration::days(90))
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        assert_eq!(logs.list_recent(&account.id, 10).await.unwrap().len(), 2);
    }
}
