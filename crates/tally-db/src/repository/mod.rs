//! # Repository Module
//!
//! Database repository implementations for Tally.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SyncOrchestrator                                                      │
//! │       │                                                                 │
//! │       │  db.metrics().apply_batch(&account_id, &metrics, 100)          │
//! │       ▼                                                                 │
//! │  MetricRepository                                                      │
//! │  ├── apply_batch(&self, account_id, metrics, chunk_size)               │
//! │  ├── list_range(&self, account_id, from, to, metric_type)              │
//! │  └── count_for_account(&self, account_id)                              │
//! │       │                                                                 │
//! │       │  SQL (one transaction per chunk)                               │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`AccountRepository`](account::AccountRepository) - Account CRUD
//! - [`ProjectRepository`](project::ProjectRepository) - Project reads and edits
//! - [`MetricRepository`](metric::MetricRepository) - Dedup engine and metric reads
//! - [`SyncLogRepository`](sync_log::SyncLogRepository) - Attempt history

pub mod account;
pub mod metric;
pub mod project;
pub mod sync_log;
