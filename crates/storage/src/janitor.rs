//! Periodic retention sweep over the storage tree.
//!
//! Each top-level entry of a category (normally a `<job_id>` directory) is aged
//! by the newest modification time found anywhere beneath it, and removed as a
//! whole once that time falls behind the retention horizon. Directories of
//! jobs that are still registered as active are never touched.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use convertd_core::config::StorageConfig;
use convertd_core::JobId;

use crate::error::StorageError;
use crate::manager::{Category, StorageManager};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub skipped_active: usize,
    pub failed: usize,
}

pub struct Janitor {
    storage: StorageManager,
    retention: Duration,
    interval: Duration,
}

impl Janitor {
    pub fn new(storage: StorageManager, retention: Duration, interval: Duration) -> Self {
        Self {
            storage,
            retention,
            interval,
        }
    }

    pub fn from_config(storage: StorageManager, config: &StorageConfig) -> Self {
        Self::new(
            storage,
            Duration::from_secs(config.cleanup_hours.saturating_mul(3600)),
            Duration::from_secs(config.cleanup_interval_minutes.max(1).saturating_mul(60)),
        )
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Sweep against the current clock.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        self.sweep_at(SystemTime::now()).await
    }

    /// Delete every entry whose newest mtime is older than `now - retention`.
    pub async fn sweep_at(&self, now: SystemTime) -> Result<SweepReport, StorageError> {
        let cutoff = now.checked_sub(self.retention).unwrap_or(SystemTime::UNIX_EPOCH);
        let storage = self.storage.clone();

        let report = tokio::task::spawn_blocking(move || sweep_blocking(&storage, cutoff))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            skipped_active = report.skipped_active,
            failed = report.failed,
            "janitor sweep complete"
        );
        Ok(report)
    }

    /// Run the sweep on a fixed interval until `cancel` fires.
    ///
    /// The first tick fires immediately, so leftovers from a previous run are
    /// reclaimed at startup.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                retention_secs = self.retention.as_secs(),
                interval_secs = self.interval.as_secs(),
                "janitor started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "janitor sweep failed");
                        }
                    }
                }
            }
            info!("janitor stopped");
        })
    }
}

fn sweep_blocking(storage: &StorageManager, cutoff: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();
    for category in Category::ALL {
        let dir = storage.category_dir(category);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(category = %category, error = %e, "cannot list storage category");
                report.failed += 1;
                continue;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            report.scanned += 1;

            // Re-read per entry: a job may have been allocated since the last one.
            if is_active_job_dir(&path, &storage.active_jobs()) {
                report.skipped_active += 1;
                continue;
            }

            let Some(newest) = newest_mtime(&path) else {
                // Vanished mid-walk; its owner already removed it.
                continue;
            };
            if newest >= cutoff {
                continue;
            }

            match remove_entry(&path) {
                Ok(()) => {
                    report.deleted += 1;
                    debug!(category = %category, path = %path.display(), "expired entry removed");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(category = %category, path = %path.display(), error = %e, "failed to remove expired entry");
                }
            }
        }
    }
    report
}

fn is_active_job_dir(path: &Path, active: &HashSet<JobId>) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| Uuid::parse_str(n).ok())
        .is_some_and(|id| active.contains(&id))
}

/// Newest modification time of `path` and everything beneath it.
fn newest_mtime(path: &Path) -> Option<SystemTime> {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .max()
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
