//! # File Import Adapter
//!
//! Reads metrics from a JSON export on disk. Useful for providers without an
//! API and for backfilling history.
//!
//! Credentials: `{ "path": "/path/to/export.json" }`
//!
//! The export is a JSON array of normalized metrics:
//! ```json
//! [
//!   { "metricType": "revenue", "value": 120.5, "date": "2026-02-01", "currency": "USD" },
//!   { "metricType": "mrr", "value": 900, "date": "2026-02-01", "projectId": "app-1",
//!     "projectName": "Mobile App", "metadata": { "country": "DE" } }
//! ]
//! ```
//!
//! Metrics dated before the incremental cursor are skipped.

use async_trait::async_trait;
use tracing::debug;

use tally_core::{Credentials, NormalizedMetric};

use crate::fetcher::{
    DataFetcher, FetchError, FetchOutcome, FetchRequest, PhaseRecorder, StepReporter,
};

/// Provider id stored on file-import accounts.
pub const PROVIDER_ID: &str = "file_import";

#[derive(Debug, Clone, Copy, Default)]
pub struct FileImportFetcher;

impl FileImportFetcher {
    pub fn new() -> Self {
        FileImportFetcher
    }
}

fn export_path(credentials: &Credentials) -> Result<&str, FetchError> {
    credentials
        .get_str("path")
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| FetchError::InvalidCredentials("missing \"path\"".into()))
}

#[async_trait]
impl DataFetcher for FileImportFetcher {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    fn display_name(&self) -> &str {
        "File import"
    }

    async fn sync(
        &self,
        request: FetchRequest<'_>,
        reporter: &dyn StepReporter,
    ) -> Result<FetchOutcome, FetchError> {
        let path = export_path(request.credentials)?.to_string();
        let since = request.since_date();
        let mut phases = PhaseRecorder::new(reporter);

        // Reading and parsing are one phase: a corrupt export yields nothing,
        // so it must fail the whole import and leave the cursor alone.
        phases
            .collect("import_metrics", "Import metrics", async move {
                let contents = tokio::fs::read_to_string(&path).await?;
                let metrics: Vec<NormalizedMetric> = serde_json::from_str(&contents)?;
                let total = metrics.len();
                let kept: Vec<NormalizedMetric> = metrics
                    .into_iter()
                    .filter(|m| since.map_or(true, |since| m.date >= since))
                    .collect();

                debug!(total, kept = kept.len(), ?since, "Parsed export");
                Ok::<_, FetchError>(kept)
            })
            .await;

        Ok(phases.finish())
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> Result<bool, FetchError> {
        let path = export_path(credentials)?;

        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
