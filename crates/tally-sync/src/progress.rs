//! # Progress Tracker
//!
//! Process-local, ephemeral progress of syncs for UI polling.
//!
//! ## Entry Lifetime
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  start ──► upsert_step* ──► finalize ──► (idle) ──► removed            │
//! │    │            │               │            ▲                          │
//! │    └────────────┴───────────────┴── each mutation restarts the idle    │
//! │                                     timer (default 10 minutes)          │
//! │                                                                         │
//! │  Nothing here is durable. The sync log is the source of truth;         │
//! │  losing an entry only means the UI shows no live steps.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use tally_core::{SyncProgress, SyncStatus, SyncStep};

/// Default idle period after which an untouched entry is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

struct Entry {
    progress: SyncProgress,
    generation: u64,
    cleanup: Option<JoinHandle<()>>,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    idle_timeout: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to the progress map. Cloning is cheap.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl ProgressTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        ProgressTracker {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                idle_timeout,
            }),
        }
    }

    /// Starts (or restarts) a `running` entry with no steps.
    pub fn start(&self, account_id: &str) -> SyncProgress {
        let progress = SyncProgress::start(account_id, Utc::now());
        let mut entries = self.inner.lock();

        let generation = match entries.remove(account_id) {
            Some(old) => {
                abort(old.cleanup);
                old.generation + 1
            }
            None => 0,
        };

        let mut entry = Entry {
            progress: progress.clone(),
            generation,
            cleanup: None,
        };
        entry.cleanup = self.schedule_cleanup(account_id, generation);
        entries.insert(account_id.to_string(), entry);

        progress
    }

    /// Appends a step, or replaces the step with the same key.
    ///
    /// Ignored if there is no entry for the account.
    pub fn upsert_step(&self, account_id: &str, step: SyncStep) {
        self.mutate(account_id, |progress| progress.upsert_step(step, Utc::now()));
    }

    /// Sets the terminal status.
    pub fn finalize(&self, account_id: &str, status: SyncStatus, error: Option<String>) {
        self.mutate(account_id, |progress| {
            progress.finalize(status, error, Utc::now())
        });
    }

    /// Snapshot of the account's entry.
    pub fn get(&self, account_id: &str) -> Option<SyncProgress> {
        self.inner
            .lock()
            .get(account_id)
            .map(|entry| entry.progress.clone())
    }

    /// Snapshots of every entry.
    pub fn all(&self) -> Vec<SyncProgress> {
        self.inner
            .lock()
            .values()
            .map(|entry| entry.progress.clone())
            .collect()
    }

    /// Drops the account's entry now.
    pub fn remove(&self, account_id: &str) -> Option<SyncProgress> {
        let entry = self.inner.lock().remove(account_id)?;
        abort(entry.cleanup);
        Some(entry.progress)
    }

    fn mutate(&self, account_id: &str, apply: impl FnOnce(&mut SyncProgress)) {
        let mut entries = self.inner.lock();
        let Some(entry) = entries.get_mut(account_id) else {
            debug!(account_id = %account_id, "No progress entry to update");
            return;
        };

        apply(&mut entry.progress);
        abort(entry.cleanup.take());
        entry.generation += 1;
        entry.cleanup = self.schedule_cleanup(account_id, entry.generation);
    }

    /// Spawns the idle timer for one generation of an entry.
    ///
    /// The task holds a weak reference so a dropped tracker does not live on
    /// in its timers. Without a runtime there is no timer and entries stay
    /// until removed.
    fn schedule_cleanup(&self, account_id: &str, generation: u64) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let account_id = account_id.to_string();
        let deadline = Instant::now() + self.inner.idle_timeout;

        Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut entries = inner.lock();
            // A newer mutation may have raced the abort.
            if entries
                .get(&account_id)
                .is_some_and(|entry| entry.generation == generation)
            {
                entries.remove(&account_id);
                debug!(account_id = %account_id, "Dropped idle progress entry");
            }
        }))
    }
}

fn abort(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("entries", &self.inner.lock().len())
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tally_core::StepStatus;

    use super::*;

    const IDLE: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn test_start_upsert_finalize() {
        let tracker = ProgressTracker::new(IDLE);
        tracker.start("acct");

        tracker.upsert_step("acct", SyncStep::running("sales", "Fetch sales"));
        tracker.upsert_step("acct", SyncStep::running("refunds", "Fetch refunds"));
        tracker.upsert_step(
            "acct",
            SyncStep::running("sales", "Fetch sales").succeeded(12, 30),
        );
        tracker.finalize("acct", SyncStatus::Success, None);

        let progress = tracker.get("acct").unwrap();
        assert_eq!(progress.status, SyncStatus::Success);
        assert!(progress.completed_at.is_some());
        let keys: Vec<_> = progress.steps.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["sales", "refunds"]);
        assert_eq!(progress.steps[0].status, StepStatus::Success);
        assert_eq!(progress.steps[0].records, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_without_entry_are_ignored() {
        let tracker = ProgressTracker::new(IDLE);

        tracker.upsert_step("ghost", SyncStep::running("a", "A"));
        tracker.finalize("ghost", SyncStatus::Error, Some("x".into()));

        assert!(tracker.get("ghost").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_steps() {
        let tracker = ProgressTracker::new(IDLE);
        tracker.start("acct");
        tracker.upsert_step("acct", SyncStep::running("a", "A"));
        tracker.finalize("acct", SyncStatus::Error, Some("boom".into()));

        let fresh = tracker.start("acct");

        assert_eq!(fresh.status, SyncStatus::Running);
        assert!(tracker.get("acct").unwrap().steps.is_empty());
        assert!(tracker.get("acct").unwrap().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_is_dropped() {
        let tracker = ProgressTracker::new(IDLE);
        tracker.start("acct");

        tokio::time::sleep(IDLE - Duration::from_secs(1)).await;
        assert!(tracker.get("acct").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.get("acct").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_resets_idle_timer() {
        let tracker = ProgressTracker::new(IDLE);
        tracker.start("acct");

        tokio::time::sleep(Duration::from_secs(540)).await;
        tracker.upsert_step("acct", SyncStep::running("a", "A"));

        // Past the first deadline, inside the second.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(tracker.get("acct").is_some());

        tokio::time::sleep(Duration::from_secs(481)).await;
        assert!(tracker.get("acct").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove() {
        let tracker = ProgressTracker::new(IDLE);
        tracker.start("a");
        tracker.start("b");

        assert_eq!(tracker.all().len(), 2);
        assert!(tracker.remove("a").is_some());
        assert!(tracker.remove("a").is_none());
        assert_eq!(tracker.all().len(), 1);
    }

    #[test]
    fn test_works_without_runtime() {
        let tracker = ProgressTracker::default();
        tracker.start("acct");
        tracker.finalize("acct", SyncStatus::Success, None);

        assert_eq!(tracker.get("acct").unwrap().status, SyncStatus::Success);
    }
}
