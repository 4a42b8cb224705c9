//! # tally-core: Pure Domain Logic for Tally
//!
//! Every other crate in the workspace speaks in the types defined here.
//! Nothing in this crate touches the disk, the network, or a database.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 tally-syncd (process entry point)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   tally-sync: vault, fetchers, progress, orchestrator           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   tally-db: accounts, projects, metrics (dedup), sync logs      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  metric   │  │ validation│  │  redact   │  │   │
//! │  │   │  Account  │  │ Identity  │  │  metric   │  │  secret   │  │   │
//! │  │   │  SyncLog  │  │   Key     │  │  checks   │  │ scrubbing │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Accounts, projects, sync logs, progress and steps
//! - [`metric`] - Normalized metrics, metadata canonicalization, identity keys
//! - [`validation`] - Well-formedness checks for fetched metrics
//! - [`redact`] - Secret scrubbing for error text
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use tally_core::metric::{MetricMetadata, NormalizedMetric};
//!
//! let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
//! let by_country = NormalizedMetric::new("revenue", 120.0, date)
//!     .with_currency("USD")
//!     .with_metadata(MetricMetadata::new().with("country", "DE"));
//!
//! let key = by_country.identity_key("acct-1");
//! assert_eq!(key.metadata, r#"{"country":"DE"}"#);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod metric;
pub mod redact;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use metric::{IdentityKey, MetricMetadata, NormalizedMetric};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Error text written when a `running` sync log outlived the staleness window.
pub const STALE_SYNC_MESSAGE: &str = "stale running sync detected";

/// Longest error text kept after sanitizing (characters).
pub const MAX_ERROR_LEN: usize = 2000;
