//! Periodic atomic snapshot of the persistent store.
//!
//! Each cycle exports into a hidden temporary file next to the snapshot and
//! renames it over the snapshot. The snapshot is therefore either the previous
//! complete copy or the new complete copy, never a partial write.

use crate::channels::Scope;
use crate::store::Store;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Anything that can write a consistent copy of itself to a path while live.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn export(&self, dest: &Path) -> anyhow::Result<()>;
}

#[async_trait]
impl SnapshotSource for Store {
    async fn export(&self, dest: &Path) -> anyhow::Result<()> {
        Store::export(self, dest).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Promoted,
    ExportFailed(String),
    PromoteFailed(String),
}

/// `.<name>.tmp` in the snapshot's directory.
pub fn temp_path_for(snapshot: &Path) -> PathBuf {
    let name = snapshot
        .file_name()
        .map_or_else(|| "snapshot".into(), |n| n.to_string_lossy().into_owned());
    snapshot.with_file_name(format!(".{name}.tmp"))
}

pub struct BackupManager {
    source: Arc<dyn SnapshotSource>,
    snapshot: PathBuf,
    temp: PathBuf,
    interval: Duration,
    timeout: Duration,
}

impl BackupManager {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        snapshot: PathBuf,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let temp = temp_path_for(&snapshot);
        Self {
            source,
            snapshot,
            temp,
            interval,
            timeout,
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// One export-then-promote cycle. Failures are logged and reported in the
    /// outcome; they never touch the promoted snapshot.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleOutcome {
        remove_if_present(&self.temp).await;

        let scope = Scope::new(shutdown, self.timeout);
        let exported = match scope.run(self.source.export(&self.temp)).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = exported {
            warn!(error = %format!("{e:#}"), path = %self.temp.display(), "snapshot export failed");
            remove_if_present(&self.temp).await;
            return CycleOutcome::ExportFailed(format!("{e:#}"));
        }

        match tokio::fs::rename(&self.temp, &self.snapshot).await {
            Ok(()) => {
                debug!(path = %self.snapshot.display(), "snapshot promoted");
                CycleOutcome::Promoted
            }
            Err(e) => {
                warn!(error = %e, path = %self.snapshot.display(), "snapshot promotion failed");
                if let Err(cleanup) = tokio::fs::remove_file(&self.temp).await {
                    warn!(error = %cleanup, path = %self.temp.display(), "failed to remove temporary snapshot");
                }
                CycleOutcome::PromoteFailed(e.to_string())
            }
        }
    }

    /// Run a cycle every interval until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            path = %self.snapshot.display(),
            interval_secs = self.interval.as_secs(),
            "backup manager started"
        );
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.run_cycle(&shutdown).await;
                }
            }
        }
    }
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale temporary snapshot"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "failed to remove temporary snapshot"),
    }
}
