//! # tally-sync: Sync Engine for Tally
//!
//! Pulls business metrics from external providers into the local store.
//! Every account is synced through the same state machine regardless of
//! which provider adapter serves it.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                SyncScheduler (interval loop)                     │  │
//! │  │  sync_all_accounts every `interval_secs`, prunes old logs       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                SyncOrchestrator (per account)                    │  │
//! │  │  in-process guard + durable `running` row guard                 │  │
//! │  │  cursor ─► fetch ─► validate ─► store ─► finalize               │  │
//! │  └───────┬───────────────────┬───────────────────┬──────────────────┘  │
//! │          ▼                   ▼                   ▼                      │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │CredentialVault │  │FetcherRegistry │  │  ProgressTracker       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ AES-256-GCM    │  │ provider id ─► │  │ Live steps per account │    │
//! │  │ records, 0600  │  │ DataFetcher    │  │ Idle entries expire    │    │
//! │  │ key file       │  │                │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  STORAGE (tally-db): accounts, projects, metrics (dedup), sync logs   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`orchestrator`] - Per-account sync state machine
//! - [`scheduler`] - Background interval loop
//! - [`accounts`] - Account management through the vault
//! - [`vault`] - Credential encryption and key file handling
//! - [`fetcher`] - The `DataFetcher` contract and phase bookkeeping
//! - [`registry`] - Provider id to adapter lookup
//! - [`providers`] - Built-in adapters
//! - [`progress`] - In-memory progress snapshots
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_db::{Database, DbConfig};
//! use tally_sync::{CredentialVault, FetcherRegistry, SyncOptions, SyncOrchestrator, TallyConfig};
//!
//! let config = TallyConfig::load_or_default(None);
//! let db = Database::new(DbConfig::new(&config.storage.database_path)).await?;
//! let vault = Arc::new(CredentialVault::open_async(&config.storage.key_path).await?);
//!
//! let orchestrator = SyncOrchestrator::new(db, vault, Arc::new(FetcherRegistry::with_builtin()))
//!     .with_settings((&config.sync).into());
//!
//! let report = orchestrator.sync_account(&account_id, SyncOptions::incremental()).await?;
//! println!("{:?}: {} records", report.status, report.records_processed);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod accounts;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod orchestrator;
pub mod progress;
pub mod providers;
pub mod registry;
pub mod scheduler;
pub mod vault;

// =============================================================================
// Re-exports
// =============================================================================

pub use accounts::AccountService;
pub use config::{StorageSettings, SyncSettings, TallyConfig};
pub use error::{SyncError, SyncResult};
pub use fetcher::{
    DataFetcher, FetchError, FetchOutcome, FetchRequest, NoOpReporter, PhaseRecorder,
    StepReporter,
};
pub use orchestrator::{
    AccountSyncResult, OrchestratorSettings, SyncOptions, SyncOrchestrator, SyncReport,
};
pub use progress::ProgressTracker;
pub use providers::FileImportFetcher;
pub use registry::FetcherRegistry;
pub use scheduler::{CycleSummary, SchedulerHandle, SyncScheduler};
pub use vault::{is_encrypted, CredentialVault, VaultError};
