//! # Account Repository
//!
//! Database operations for provider accounts.
//!
//! ## Account Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Account Lifecycle                                 │
//! │                                                                         │
//! │  1. CREATE        insert()            is_active = 1                    │
//! │  2. ROTATE        update_credentials() new vault record                │
//! │  3. DEACTIVATE    set_active(false)   skipped by sync_all, history kept│
//! │  4. DELETE        delete()            cascades to projects, metrics,   │
//! │                                       sync_logs                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::Account;

const ACCOUNT_COLUMNS: &str =
    "id, provider_id, label, encrypted_credentials, is_active, created_at, updated_at";

/// Repository for account database operations.
#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    /// Creates a new AccountRepository.
    pub fn new(pool: SqlitePool) -> Self {
        AccountRepository { pool }
    }

    /// Inserts a fully-formed account.
    pub async fn insert(&self, account: &Account) -> DbResult<()> {
        debug!(id = %account.id, provider_id = %account.provider_id, "Inserting account");

        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, provider_id, label, encrypted_credentials,
                is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&account.id)
        .bind(&account.provider_id)
        .bind(&account.label)
        .bind(&account.encrypted_credentials)
        .bind(account.is_active)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Gets an account by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = ?1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Lists every account, oldest first.
    pub async fn list(&self) -> DbResult<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts ORDER BY created_at ASC, id ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    /// Lists active accounts, oldest first (the order `sync_all_accounts` runs them).
    pub async fn list_active(&self) -> DbResult<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE is_active = 1 ORDER BY created_at ASC, id ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    /// Replaces the stored vault record.
    pub async fn update_credentials(&self, id: &str, encrypted_credentials: &str) -> DbResult<()> {
        debug!(id = %id, "Updating account credentials");

        let result = sqlx::query(
            "UPDATE accounts SET encrypted_credentials = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(encrypted_credentials)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Account", id));
        }

        Ok(())
    }

    /// Renames an account.
    pub async fn update_label(&self, id: &str, label: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE accounts SET label = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(label)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Account", id));
        }

        Ok(())
    }

    /// Activates or deactivates an account.
    ///
    /// Deactivation is the normal way to retire an account: its metrics and
    /// history stay, it is just skipped by syncs.
    pub async fn set_active(&self, id: &str, active: bool) -> DbResult<()> {
        debug!(id = %id, active, "Setting account active flag");

        let result =
            sqlx::query("UPDATE accounts SET is_active = ?2, updated_at = ?3 WHERE id = ?1")
                .bind(id)
                .bind(active)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Account", id));
        }

        Ok(())
    }

    /// Hard-deletes an account; projects, metrics and logs cascade.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        debug!(id = %id, "Deleting account");

        let result = sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Account", id));
        }

        Ok(())
    }

    /// Counts accounts (for diagnostics).
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
