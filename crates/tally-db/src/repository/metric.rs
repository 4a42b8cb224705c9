//! # Metric Repository (Dedup Engine)
//!
//! Turns an unordered batch of normalized metrics into exactly one stored row
//! per identity key.
//!
//! ## Batch Application
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    apply_batch(account, metrics, 100)                   │
//! │                                                                         │
//! │  metrics[0..100]  ──► BEGIN                                            │
//! │                       ├── register unseen project ids                  │
//! │                       ├── for each metric (in order):                  │
//! │                       │     pending?  ──► DELETE slot (any metadata)   │
//! │                       │                   INSERT                       │
//! │                       │     key found ──► UPDATE first row             │
//! │                       │                   DELETE other rows with key   │
//! │                       │     otherwise ──► INSERT                       │
//! │                       └── COMMIT                                       │
//! │                    ──► yield_now()                                     │
//! │  metrics[100..200] ──► BEGIN ... COMMIT                                │
//! │                    ──► yield_now()                                     │
//! │  ...                                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Metrics are applied in input order, so when a batch carries the same key
//! twice the later value is the one left in storage.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::metric::{IdentityKey, Metric, MetricMetadata, NormalizedMetric};

/// Default number of metrics written per transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

// =============================================================================
// Batch Summary
// =============================================================================

/// What one `apply_batch` call did to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// New rows written.
    pub inserted: u64,
    /// Existing rows whose value/currency/metadata were overwritten.
    pub updated: u64,
    /// Extra rows removed because they shared a key with an updated row.
    pub deleted_duplicates: u64,
    /// Rows removed by pending metrics clearing their slot.
    pub pending_replaced: u64,
    /// Projects registered because a metric referenced them first.
    pub projects_created: u64,
}

impl BatchSummary {
    /// Rows inserted or updated.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    fn absorb(&mut self, other: BatchSummary) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted_duplicates += other.deleted_duplicates;
        self.pending_replaced += other.pending_replaced;
        self.projects_created += other.projects_created;
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct MetricRow {
    id: String,
    account_id: String,
    project_id: Option<String>,
    metric_type: String,
    value: f64,
    currency: Option<String>,
    date: NaiveDate,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MetricRow> for Metric {
    type Error = DbError;

    fn try_from(row: MetricRow) -> Result<Self, Self::Error> {
        let metadata = MetricMetadata::from_json(&row.metadata).map_err(|e| DbError::CorruptRow {
            entity: "Metric".to_string(),
            id: row.id.clone(),
            reason: e.to_string(),
        })?;

        Ok(Metric {
            id: row.id,
            account_id: row.account_id,
            project_id: row.project_id,
            metric_type: row.metric_type,
            value: row.value,
            currency: row.currency,
            date: row.date,
            metadata,
            created_at: row.created_at,
        })
    }
}

const METRIC_COLUMNS: &str =
    "id, account_id, project_id, metric_type, value, currency, date, metadata, created_at";

// =============================================================================
// Repository
// =============================================================================

/// Repository for metric persistence and reads.
#[derive(Debug, Clone)]
pub struct MetricRepository {
    pool: SqlitePool,
}

impl MetricRepository {
    /// Creates a new MetricRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MetricRepository { pool }
    }

    /// Applies a batch of normalized metrics for one account.
    ///
    /// ## Guarantees
    /// - One transaction per chunk of `chunk_size` metrics; a failing chunk
    ///   rolls back alone and the error is returned (earlier chunks stay)
    /// - The task yields between chunks so readers are not starved
    /// - Every referenced project exists before the metric row is written
    /// - After the call, each identity key in the batch maps to one row
    ///
    /// A `chunk_size` of 0 is treated as [`DEFAULT_CHUNK_SIZE`].
    pub async fn apply_batch(
        &self,
        account_id: &str,
        metrics: &[NormalizedMetric],
        chunk_size: usize,
    ) -> DbResult<BatchSummary> {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };

        let mut summary = BatchSummary::default();
        if metrics.is_empty() {
            return Ok(summary);
        }

        let chunk_count = metrics.len().div_ceil(chunk_size);
        for (index, chunk) in metrics.chunks(chunk_size).enumerate() {
            let chunk_summary = self.apply_chunk(account_id, chunk).await?;
            debug!(
                account_id = %account_id,
                chunk = index + 1,
                of = chunk_count,
                inserted = chunk_summary.inserted,
                updated = chunk_summary.updated,
                "Metric chunk committed"
            );
            summary.absorb(chunk_summary);

            if index + 1 < chunk_count {
                tokio::task::yield_now().await;
            }
        }

        info!(
            account_id = %account_id,
            total = metrics.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            deleted_duplicates = summary.deleted_duplicates,
            pending_replaced = summary.pending_replaced,
            projects_created = summary.projects_created,
            "Metric batch applied"
        );

        Ok(summary)
    }

    async fn apply_chunk(
        &self,
        account_id: &str,
        chunk: &[NormalizedMetric],
    ) -> DbResult<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut tx = self.pool.begin().await?;

        summary.projects_created = register_projects(&mut tx, account_id, chunk).await?;

        for metric in chunk {
            let key = metric.identity_key(account_id);

            if metric.pending {
                summary.pending_replaced += clear_slot(&mut tx, &key).await?;
                insert_metric(&mut tx, &key, metric).await?;
                summary.inserted += 1;
                continue;
            }

            let existing = find_ids_by_key(&mut tx, &key).await?;
            match existing.split_first() {
                Some((keep, duplicates)) => {
                    update_metric(&mut tx, keep, &key, metric).await?;
                    summary.updated += 1;
                    for duplicate in duplicates {
                        delete_by_id(&mut tx, duplicate).await?;
                        summary.deleted_duplicates += 1;
                    }
                }
                None => {
                    insert_metric(&mut tx, &key, metric).await?;
                    summary.inserted += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Returns every stored row matching an identity key (normally 0 or 1).
    pub async fn find_by_key(&self, key: &IdentityKey) -> DbResult<Vec<Metric>> {
        let rows = sqlx::query_as::<_, MetricRow>(&format!(
            r#"
            SELECT {}
            FROM metrics
            WHERE account_id = ?1 AND metric_type = ?2 AND date = ?3
              AND project_id IS ?4 AND metadata = ?5
            ORDER BY created_at ASC, id ASC
            "#,
            METRIC_COLUMNS
        ))
        .bind(&key.account_id)
        .bind(&key.metric_type)
        .bind(key.date)
        .bind(&key.project_id)
        .bind(&key.metadata)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Metric::try_from).collect()
    }

    /// Lists an account's metrics with `from <= date <= to`, optionally for one
    /// metric type, ordered by date.
    pub async fn list_range(
        &self,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        metric_type: Option<&str>,
    ) -> DbResult<Vec<Metric>> {
        let rows = sqlx::query_as::<_, MetricRow>(&format!(
            r#"
            SELECT {}
            FROM metrics
            WHERE account_id = ?1 AND date >= ?2 AND date <= ?3
              AND (?4 IS NULL OR metric_type = ?4)
            ORDER BY date ASC, metric_type ASC, project_id ASC, metadata ASC
            "#,
            METRIC_COLUMNS
        ))
        .bind(account_id)
        .bind(from)
        .bind(to)
        .bind(metric_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Metric::try_from).collect()
    }

    /// Counts stored metric rows for an account.
    pub async fn count_for_account(&self, account_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics WHERE account_id = ?1")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Transaction Steps
// =============================================================================

/// Inserts projects referenced by the chunk that don't exist yet.
///
/// The label is the first carried display name for the id, else the raw id.
async fn register_projects(
    tx: &mut Transaction<'_, Sqlite>,
    account_id: &str,
    chunk: &[NormalizedMetric],
) -> DbResult<u64> {
    let mut referenced: BTreeMap<&str, Option<&str>> = BTreeMap::new();
    for metric in chunk {
        if let Some(project_id) = metric.project_id.as_deref() {
            let name = referenced.entry(project_id).or_insert(None);
            if name.is_none() {
                *name = metric.project_name.as_deref();
            }
        }
    }

    let now = Utc::now();
    let mut created = 0;
    for (project_id, name) in referenced {
        let result = sqlx::query(
            r#"
            INSERT INTO projects (account_id, id, label, filters, created_at, updated_at)
            VALUES (?1, ?2, ?3, '{}', ?4, ?4)
            ON CONFLICT (account_id, id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(project_id)
        .bind(name.unwrap_or(project_id))
        .bind(now)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() > 0 {
            debug!(account_id = %account_id, project_id = %project_id, "Registered project");
            created += 1;
        }
    }

    Ok(created)
}

async fn find_ids_by_key(
    tx: &mut Transaction<'_, Sqlite>,
    key: &IdentityKey,
) -> DbResult<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM metrics
        WHERE account_id = ?1 AND metric_type = ?2 AND date = ?3
          AND project_id IS ?4 AND metadata = ?5
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(&key.account_id)
    .bind(&key.metric_type)
    .bind(key.date)
    .bind(&key.project_id)
    .bind(&key.metadata)
    .fetch_all(&mut **tx)
    .await?;

    Ok(ids)
}

/// Deletes every row in the key's (account, type, date, project) slot,
/// whatever its metadata.
async fn clear_slot(tx: &mut Transaction<'_, Sqlite>, key: &IdentityKey) -> DbResult<u64> {
    let (account_id, metric_type, date, project_id) = key.slot();
    let result = sqlx::query(
        r#"
        DELETE FROM metrics
        WHERE account_id = ?1 AND metric_type = ?2 AND date = ?3 AND project_id IS ?4
        "#,
    )
    .bind(account_id)
    .bind(metric_type)
    .bind(date)
    .bind(project_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

async fn insert_metric(
    tx: &mut Transaction<'_, Sqlite>,
    key: &IdentityKey,
    metric: &NormalizedMetric,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO metrics (
            id, account_id, project_id, metric_type, value,
            currency, date, metadata, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&key.account_id)
    .bind(&key.project_id)
    .bind(&key.metric_type)
    .bind(metric.value)
    .bind(&metric.currency)
    .bind(key.date)
    .bind(&key.metadata)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn update_metric(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    key: &IdentityKey,
    metric: &NormalizedMetric,
) -> DbResult<()> {
    sqlx::query("UPDATE metrics SET value = ?2, currency = ?3, metadata = ?4 WHERE id = ?1")
        .bind(id)
        .bind(metric.value)
        .bind(&metric.currency)
        .bind(&key.metadata)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn delete_by_id(tx: &mut Transaction<'_, Sqlite>, id: &str) -> DbResult<()> {
    sqlx::query("DELETE FROM metrics WHERE id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
