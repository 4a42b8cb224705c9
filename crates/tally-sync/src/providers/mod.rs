//! # Provider Adapters
//!
//! Built-in [`DataFetcher`](crate::fetcher::DataFetcher) implementations.
//! Each one is registered explicitly in
//! [`FetcherRegistry::with_builtin`](crate::registry::FetcherRegistry::with_builtin).

pub mod file_import;

pub use file_import::FileImportFetcher;
