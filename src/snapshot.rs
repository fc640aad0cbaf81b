//! Snapshot lifecycle
//!
//! Each run writes into `<root>/<snapshot_id>`, created with an `incomplete`
//! marker. Only a run with zero failures removes the marker and repoints the
//! `<root>/current` alias at its snapshot. The alias is replaced by renaming a
//! freshly created symlink over it, so readers never observe it missing.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

use crate::Result;

/// Presence marker for snapshots that have not been finalized
pub const INCOMPLETE_MARKER: &str = "incomplete";

/// Alias to the most recent complete snapshot
pub const CURRENT_ALIAS: &str = "current";

const ID_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Timestamp identifier of a snapshot, e.g. `20240131T235959`
///
/// The fixed-width format makes lexicographic and temporal order agree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Identifier for a point in time (UTC, second resolution)
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self(time.format(ID_FORMAT).to_string())
    }

    /// Parse an identifier; directory names that are not identifiers yield `None`
    pub fn parse(value: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(value, ID_FORMAT).ok()?;
        Some(Self(value.to_string()))
    }

    /// Point in time this identifier denotes
    pub fn time(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.0, ID_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Identifier one second later
    pub fn successor(&self) -> Option<Self> {
        self.time()
            .map(|time| Self::from_time(time + Duration::seconds(1)))
    }

    /// Identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// All steps succeeded; `current` points here
    Complete,
    /// At least one step failed; the incomplete marker remains
    Incomplete,
}

/// An open snapshot owned by the running backup
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    id: SnapshotId,
    path: PathBuf,
}

impl SnapshotHandle {
    /// Snapshot identifier
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// Snapshot directory; steps run with this as their working directory
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates and finalizes snapshots under a snapshot root
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    root: PathBuf,
}

impl SnapshotManager {
    /// Manager for snapshots under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Snapshot root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the snapshot root if needed
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// All snapshot identifiers present on disk, oldest first
    pub async fn list(&self) -> Result<Vec<SnapshotId>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(SnapshotId::parse) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Identifier for a new snapshot at `now`
    ///
    /// Strictly greater than every snapshot already on disk, even when the clock
    /// has not advanced or has stepped backwards.
    pub async fn next_id(&self, now: DateTime<Utc>) -> Result<SnapshotId> {
        let candidate = SnapshotId::from_time(now);
        match self.list().await?.pop() {
            Some(latest) if candidate <= latest => Ok(latest.successor().unwrap_or(candidate)),
            _ => Ok(candidate),
        }
    }

    /// Create the snapshot directory and its incomplete marker
    pub async fn begin(&self, id: SnapshotId) -> Result<SnapshotHandle> {
        let path = self.root.join(id.as_str());
        fs::create_dir(&path).await?;
        fs::write(path.join(INCOMPLETE_MARKER), b"").await?;
        info!(snapshot_id = %id, path = %path.display(), "Opened snapshot");
        Ok(SnapshotHandle { id, path })
    }

    /// Finalize a snapshot
    ///
    /// With no failures the incomplete marker is removed and `current` repointed;
    /// otherwise the snapshot is left incomplete for inspection.
    pub async fn finalize(
        &self,
        handle: &SnapshotHandle,
        failures: &[String],
    ) -> Result<SnapshotStatus> {
        if !failures.is_empty() {
            warn!(
                snapshot_id = %handle.id,
                failures = %failures.join(", "),
                "Leaving snapshot incomplete"
            );
            return Ok(SnapshotStatus::Incomplete);
        }

        // The marker stays until `current` refers here, so a failure on either
        // side leaves exactly one of the two in place.
        let previous = self.current().await?;
        self.point_current_at(&handle.id).await?;
        match fs::remove_file(handle.path.join(INCOMPLETE_MARKER)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                error!(snapshot_id = %handle.id, error = %e, "Failed to remove incomplete marker");
                self.restore_current(previous.as_ref()).await;
                return Err(e.into());
            }
            _ => {}
        }
        info!(snapshot_id = %handle.id, "Snapshot complete");
        Ok(SnapshotStatus::Complete)
    }

    async fn restore_current(&self, previous: Option<&SnapshotId>) {
        let restored = match previous {
            Some(id) => self.point_current_at(id).await,
            None => fs::remove_file(self.root.join(CURRENT_ALIAS))
                .await
                .map_err(Into::into),
        };
        if let Err(e) = restored {
            error!(error = %e, "Failed to restore the current alias");
        }
    }

    /// Snapshot the `current` alias refers to
    pub async fn current(&self) -> Result<Option<SnapshotId>> {
        match fs::read_link(self.root.join(CURRENT_ALIAS)).await {
            Ok(target) => Ok(target
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(SnapshotId::parse)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory of the snapshot `current` refers to
    pub async fn current_path(&self) -> Result<Option<PathBuf>> {
        Ok(self.current().await?.map(|id| self.root.join(id.as_str())))
    }

    /// Whether a snapshot still carries its incomplete marker
    pub async fn is_incomplete(&self, id: &SnapshotId) -> bool {
        fs::symlink_metadata(self.root.join(id.as_str()).join(INCOMPLETE_MARKER))
            .await
            .is_ok()
    }

    async fn point_current_at(&self, id: &SnapshotId) -> Result<()> {
        let alias = self.root.join(CURRENT_ALIAS);
        let staging = self.root.join(format!(".{}.{}", CURRENT_ALIAS, id));
        match fs::remove_file(&staging).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        // Relative target so the snapshot root can be moved as a whole
        fs::symlink(id.as_str(), &staging).await?;
        fs::rename(&staging, &alias).await?;
        Ok(())
    }
}
