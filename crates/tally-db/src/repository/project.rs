//! # Project Repository
//!
//! Reads and edits of account sub-entities. Projects are never created here:
//! the metric repository registers them the first time a metric points at an
//! unseen project id.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use tally_core::Project;

/// Repository for project database operations.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    /// Creates a new ProjectRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ProjectRepository { pool }
    }

    /// Gets one project of an account.
    pub async fn get(&self, account_id: &str, id: &str) -> DbResult<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT account_id, id, label, filters, created_at, updated_at
            FROM projects
            WHERE account_id = ?1 AND id = ?2
            "#,
        )
        .bind(account_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(project)
    }

    /// Lists an account's projects by label.
    pub async fn list_for_account(&self, account_id: &str) -> DbResult<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT account_id, id, label, filters, created_at, updated_at
            FROM projects
            WHERE account_id = ?1
            ORDER BY label ASC, id ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }

    /// Updates the display label and filter JSON of a project.
    pub async fn update(
        &self,
        account_id: &str,
        id: &str,
        label: &str,
        filters: &serde_json::Value,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects SET label = ?3, filters = ?4, updated_at = ?5
            WHERE account_id = ?1 AND id = ?2
            "#,
        )
        .bind(account_id)
        .bind(id)
        .bind(label)
        .bind(filters.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Project", format!("{}/{}", account_id, id)));
        }

        Ok(())
    }
}
