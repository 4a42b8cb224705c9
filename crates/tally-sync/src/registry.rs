//! # Fetcher Registry
//!
//! Explicit map of provider id to adapter, built once by the entry point.
//! Adapters do not register themselves.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::fetcher::DataFetcher;
use crate::providers::FileImportFetcher;

/// Provider adapters available to this process.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn DataFetcher>>,
}

impl FetcherRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter.
    pub fn with_builtin() -> Self {
        Self::new().with(FileImportFetcher::new())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, fetcher: impl DataFetcher + 'static) -> Self {
        self.register(Arc::new(fetcher));
        self
    }

    /// Adds an adapter, replacing any previous one with the same provider id.
    pub fn register(&mut self, fetcher: Arc<dyn DataFetcher>) {
        let provider_id = fetcher.provider_id().to_string();
        debug!(provider_id = %provider_id, "Registering fetcher");
        self.fetchers.insert(provider_id, fetcher);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn DataFetcher>> {
        self.fetchers.get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.fetchers.contains_key(provider_id)
    }

    /// Registered provider ids, sorted.
    pub fn provider_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.fetchers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherRegistry")
            .field("providers", &self.provider_ids())
            .finish()
    }
}
