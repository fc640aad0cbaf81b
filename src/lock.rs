//! Run lock marker
//!
//! A single `in-progress` file in the snapshot root holds `"<snapshot_id> <pid>"`
//! for the run currently in flight. Acquisition refuses to proceed while a live
//! backup process owns the marker, discards markers left by dead processes, and
//! treats the symlink format of older releases as an operator problem.

use crate::{BackupError, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker file name inside the snapshot root
pub const LOCK_FILE: &str = "in-progress";

/// Snapshot id and process id of the run holding the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMarker {
    /// Snapshot the owning run writes into
    pub snapshot_id: String,
    /// Owning process
    pub pid: u32,
}

impl LockMarker {
    /// Create a marker
    pub fn new(snapshot_id: impl Into<String>, pid: u32) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            pid,
        }
    }

    /// Marker for the current process
    pub fn for_current_process(snapshot_id: impl Into<String>) -> Self {
        Self::new(snapshot_id, std::process::id())
    }

    /// On-disk representation
    pub fn serialize(&self) -> String {
        format!("{} {}\n", self.snapshot_id, self.pid)
    }

    /// Parse the two space separated fields; anything else is malformed
    pub fn parse(contents: &str) -> Option<Self> {
        let mut fields = contents.split_whitespace();
        let snapshot_id = fields.next()?;
        let pid = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self::new(snapshot_id, pid))
    }
}

/// Answers whether a recorded pid still belongs to a running backup
pub trait ProcessProbe: Send + Sync {
    /// True if `pid` is alive and identifiable as a backup process
    fn is_backup_process(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)` and `/proc/<pid>/cmdline`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_backup_process(&self, pid: u32) -> bool {
        if !is_pid_alive(pid) {
            return false;
        }
        // Without procfs the command line cannot be checked; a live pid counts.
        match fs::read(format!("/proc/{}/cmdline", pid)) {
            Ok(raw) => String::from_utf8_lossy(&raw).contains("backup"),
            Err(_) => true,
        }
    }
}

/// Check whether a given PID is alive.
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the existence and permission checks only.
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists under another user.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        true
    }
}

/// Single-run mutual exclusion over a snapshot root
#[derive(Clone)]
pub struct LockManager {
    path: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

impl LockManager {
    /// Lock manager for the marker inside `root`
    pub fn new(root: &Path, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            path: root.join(LOCK_FILE),
            probe,
        }
    }

    /// Path of the marker file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current marker, if any
    pub fn read(&self) -> Result<Option<LockMarker>> {
        let metadata = match fs::symlink_metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if metadata.file_type().is_symlink() {
            return Err(BackupError::LegacyLockFormat(self.path.clone()));
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        LockMarker::parse(&contents)
            .map(Some)
            .ok_or_else(|| BackupError::MalformedLock {
                path: self.path.clone(),
                contents,
            })
    }

    /// Take the lock for `marker`
    ///
    /// Fails with [`BackupError::LockConflict`] while a live backup process owns
    /// the existing marker. Stale markers are removed first.
    pub fn acquire(&self, marker: &LockMarker) -> Result<()> {
        // A racing run may create the marker between our read and write; one retry
        // re-reads it so the loser reports the conflict.
        for _ in 0..2 {
            if let Some(existing) = self.read()? {
                if self.probe.is_backup_process(existing.pid) {
                    return Err(BackupError::LockConflict {
                        snapshot_id: existing.snapshot_id,
                        pid: existing.pid,
                    });
                }
                warn!(
                    snapshot_id = %existing.snapshot_id,
                    pid = existing.pid,
                    "Discarding stale lock marker"
                );
                remove_if_present(&self.path)?;
            }

            match self.write_exclusive(marker) {
                Ok(()) => {
                    info!(
                        snapshot_id = %marker.snapshot_id,
                        pid = marker.pid,
                        "Acquired backup lock"
                    );
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Lock marker appeared concurrently, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.read()? {
            Some(existing) => Err(BackupError::LockConflict {
                snapshot_id: existing.snapshot_id,
                pid: existing.pid,
            }),
            None => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "lock marker kept changing during acquisition",
            )
            .into()),
        }
    }

    /// Remove the marker only if it still records exactly `marker`
    ///
    /// Returns whether the marker was removed. A missing, foreign or legacy marker
    /// is left untouched.
    pub fn release(&self, marker: &LockMarker) -> Result<bool> {
        match self.read() {
            Ok(Some(existing)) if existing == *marker => {
                remove_if_present(&self.path)?;
                info!(snapshot_id = %marker.snapshot_id, pid = marker.pid, "Released backup lock");
                Ok(true)
            }
            Ok(Some(existing)) => {
                debug!(
                    owner_snapshot = %existing.snapshot_id,
                    owner_pid = existing.pid,
                    "Lock marker belongs to another run, leaving it"
                );
                Ok(false)
            }
            Ok(None) => Ok(false),
            Err(BackupError::LegacyLockFormat(_)) | Err(BackupError::MalformedLock { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn write_exclusive(&self, marker: &LockMarker) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(marker.serialize().as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist_noclobber(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
