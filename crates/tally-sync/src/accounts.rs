//! # Account Service
//!
//! Account management on top of the vault, registry and account repository.
//! Credentials only ever reach the database as vault records.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::validation::validate_label;
use tally_core::{Account, Credentials, SyncLog};
use tally_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::registry::FetcherRegistry;
use crate::vault::{is_encrypted, CredentialVault};

/// Creates, rotates, retires and lists provider accounts.
#[derive(Debug, Clone)]
pub struct AccountService {
    db: Database,
    vault: Arc<CredentialVault>,
    registry: Arc<FetcherRegistry>,
}

impl AccountService {
    pub fn new(db: Database, vault: Arc<CredentialVault>, registry: Arc<FetcherRegistry>) -> Self {
        AccountService {
            db,
            vault,
            registry,
        }
    }

    /// Creates an active account after the provider accepts the credentials.
    pub async fn create(
        &self,
        provider_id: &str,
        label: &str,
        credentials: &Credentials,
    ) -> SyncResult<Account> {
        validate_label("label", label)?;
        self.check_credentials(provider_id, credentials).await?;

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            provider_id: provider_id.to_string(),
            label: label.trim().to_string(),
            encrypted_credentials: self.vault.encrypt_credentials(credentials)?,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.db.accounts().insert(&account).await?;
        info!(account_id = %account.id, provider_id = %provider_id, "Account created");

        Ok(account)
    }

    /// Replaces an account's credentials after the provider accepts them.
    pub async fn rotate_credentials(
        &self,
        account_id: &str,
        credentials: &Credentials,
    ) -> SyncResult<()> {
        let account = self.get(account_id).await?;
        self.check_credentials(&account.provider_id, credentials)
            .await?;

        let record = self.vault.encrypt_credentials(credentials)?;
        self.db
            .accounts()
            .update_credentials(account_id, &record)
            .await?;

        info!(account_id = %account_id, "Account credentials rotated");
        Ok(())
    }

    pub async fn rename(&self, account_id: &str, label: &str) -> SyncResult<()> {
        validate_label("label", label)?;
        self.db
            .accounts()
            .update_label(account_id, label.trim())
            .await
            .map_err(|e| not_found_as_account(e, account_id))
    }

    /// Stops syncing the account; its data and history stay.
    pub async fn deactivate(&self, account_id: &str) -> SyncResult<()> {
        self.set_active(account_id, false).await
    }

    pub async fn reactivate(&self, account_id: &str) -> SyncResult<()> {
        self.set_active(account_id, true).await
    }

    /// Deletes the account with its projects, metrics and logs.
    pub async fn delete(&self, account_id: &str) -> SyncResult<()> {
        self.db
            .accounts()
            .delete(account_id)
            .await
            .map_err(|e| not_found_as_account(e, account_id))?;

        info!(account_id = %account_id, "Account deleted");
        Ok(())
    }

    pub async fn get(&self, account_id: &str) -> SyncResult<Account> {
        self.db
            .accounts()
            .get_by_id(account_id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(account_id.to_string()))
    }

    pub async fn list(&self) -> SyncResult<Vec<Account>> {
        Ok(self.db.accounts().list().await?)
    }

    /// Most recent sync attempts of an account, newest first.
    pub async fn history(&self, account_id: &str, limit: u32) -> SyncResult<Vec<SyncLog>> {
        Ok(self.db.sync_logs().list_recent(account_id, limit).await?)
    }

    /// Re-encrypts every account still holding plaintext credentials.
    ///
    /// Returns how many accounts were rewritten. Accounts whose blob cannot be
    /// read are skipped with a warning.
    pub async fn migrate_plaintext_credentials(&self) -> SyncResult<usize> {
        let mut migrated = 0;

        for account in self.db.accounts().list().await? {
            if is_encrypted(&account.encrypted_credentials) {
                continue;
            }

            let credentials = match self.vault.decrypt_credentials(&account.encrypted_credentials) {
                Ok(credentials) => credentials,
                Err(err) => {
                    warn!(account_id = %account.id, error = %err, "Skipping unreadable credentials");
                    continue;
                }
            };

            let record = self.vault.encrypt_credentials(&credentials)?;
            self.db
                .accounts()
                .update_credentials(&account.id, &record)
                .await?;
            debug!(account_id = %account.id, "Encrypted plaintext credentials");
            migrated += 1;
        }

        if migrated > 0 {
            info!(migrated, "Migrated plaintext credentials");
        }
        Ok(migrated)
    }

    async fn set_active(&self, account_id: &str, active: bool) -> SyncResult<()> {
        self.db
            .accounts()
            .set_active(account_id, active)
            .await
            .map_err(|e| not_found_as_account(e, account_id))?;

        info!(account_id = %account_id, active, "Account active flag changed");
        Ok(())
    }

    async fn check_credentials(&self, provider_id: &str, credentials: &Credentials) -> SyncResult<()> {
        let fetcher = self
            .registry
            .get(provider_id)
            .ok_or_else(|| SyncError::UnknownProvider(provider_id.to_string()))?;

        if !fetcher.validate_credentials(credentials).await? {
            return Err(SyncError::InvalidCredentials(provider_id.to_string()));
        }

        Ok(())
    }
}

fn not_found_as_account(err: tally_db::DbError, account_id: &str) -> SyncError {
    if err.is_not_found() {
        SyncError::AccountNotFound(account_id.to_string())
    } else {
        SyncError::Storage(err)
    }
}
