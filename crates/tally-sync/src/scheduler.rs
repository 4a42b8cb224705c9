//! # Sync Scheduler
//!
//! Background loop that syncs every active account on an interval and prunes
//! old sync history.
//!
//! ## Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   tokio::select! {                                                     │
//! │       interval.tick()      ──► run_cycle()                             │
//! │       trigger_rx.recv()    ──► run_cycle()  (SchedulerHandle::sync_now)│
//! │       shutdown_rx.recv()   ──► break                                   │
//! │   }                                                                    │
//! │                                                                         │
//! │   run_cycle = sync_all_accounts(incremental)                           │
//! │             + prune finished logs older than log_retention_days        │
//! │                                                                         │
//! │   The first tick fires immediately, so a fresh start syncs at once.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use tally_db::Database;

use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{SyncOptions, SyncOrchestrator};

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Accounts whose sync did not start (e.g. already running).
    pub skipped: usize,
    pub pruned_logs: u64,
}

/// Handle for controlling a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    trigger_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Requests a cycle now instead of waiting for the next tick.
    pub async fn sync_now(&self) -> SyncResult<()> {
        self.trigger_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Trigger channel closed".into()))
    }

    /// Triggers graceful shutdown. A cycle in progress finishes first.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }
}

pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    db: Database,
    interval: Duration,
    log_retention: Option<chrono::Duration>,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl SyncScheduler {
    /// Creates a scheduler and its handle.
    pub fn new(
        orchestrator: SyncOrchestrator,
        db: Database,
        settings: &SyncSettings,
    ) -> (Self, SchedulerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let scheduler = SyncScheduler {
            orchestrator,
            db,
            interval: settings.interval(),
            log_retention: settings.log_retention(),
            shutdown_rx,
            trigger_rx,
        };

        (
            scheduler,
            SchedulerHandle {
                shutdown_tx,
                trigger_tx,
            },
        )
    }

    /// Runs until the handle requests shutdown (or is dropped).
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Sync scheduler starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }

                Some(()) = self.trigger_rx.recv() => {
                    debug!("Sync requested");
                    self.run_cycle().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync scheduler shutting down");
                    break;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Syncs every active account, then prunes old history.
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();

        match self.orchestrator.sync_all_accounts(SyncOptions::incremental()).await {
            Ok(results) => {
                for result in &results {
                    match &result.result {
                        Ok(report) if report.is_success() => summary.succeeded += 1,
                        Ok(_) => summary.failed += 1,
                        Err(_) => summary.skipped += 1,
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to list accounts for sync"),
        }

        if let Some(retention) = self.log_retention {
            let cutoff = Utc::now() - retention;
            match self.db.sync_logs().prune_finished_before(cutoff).await {
                Ok(pruned) => summary.pruned_logs = pruned,
                Err(e) => error!(error = %e, "Failed to prune sync logs"),
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            pruned_logs = summary.pruned_logs,
            "Sync cycle finished"
        );

        summary
    }
}
