//! # Sync Error Types
//!
//! Error types for account management and sync orchestration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Precondition   │  │  Configuration  │  │     Attempt             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  AccountNotFound│  │  InvalidConfig  │  │  Storage (DbError)      │ │
//! │  │  AccountInactive│  │  ConfigLoad...  │  │  Vault (VaultError)     │ │
//! │  │  AlreadyRunning │  │  ConfigSave...  │  │  Fetch (FetchError)     │ │
//! │  │  UnknownProvider│  │                 │  │  Internal               │ │
//! │  │  InvalidCreds   │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Precondition errors are returned from `sync_account` before anything is
//! written. Attempt errors never escape `sync_account`: they are sanitized
//! and recorded on the sync log, and surface in the returned report.

use thiserror::Error;

use crate::fetcher::FetchError;
use crate::vault::VaultError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering account management and orchestration failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Precondition Errors
    // =========================================================================
    /// No account with this id.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// The account exists but is deactivated.
    #[error("Account is inactive: {0}")]
    AccountInactive(String),

    /// Another sync for the account is in flight (in this process or durably).
    #[error("A sync is already running for account {0}")]
    AlreadyRunning(String),

    /// No adapter is registered for the provider id.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider adapter rejected the credentials.
    #[error("Credentials rejected by provider {0}")]
    InvalidCredentials(String),

    /// Bad caller input (e.g. empty label).
    #[error("Validation error: {0}")]
    Validation(#[from] tally_core::ValidationError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration values.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Attempt Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] tally_db::DbError),

    /// Credential vault failure.
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// Provider adapter failure.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Failed to serialize or parse JSON.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (e.g. a sync task panicked).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the call was rejected before any state changed.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::AccountNotFound(_)
                | SyncError::AccountInactive(_)
                | SyncError::AlreadyRunning(_)
                | SyncError::UnknownProvider(_)
                | SyncError::InvalidCredentials(_)
                | SyncError::Validation(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if retrying later may succeed.
    ///
    /// ## Retryable Errors
    /// - Another sync holds the account
    /// - Provider rate limits and network failures
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::AlreadyRunning(_) => true,
            SyncError::Fetch(err) => err.is_retryable(),
            _ => false,
        }
    }
}
