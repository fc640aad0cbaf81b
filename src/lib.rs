//! # Appliance Backup
//!
//! Orchestration core for taking a full snapshot backup of a multi-component appliance
//! (git storage, relational database, key-value store, search index, settings, SSH keys).
//!
//! ## Overview
//!
//! The data exports themselves are delegated to external collaborators reachable over a
//! remote command channel. This crate owns everything around them:
//!
//! - single-run mutual exclusion through a lock marker in the snapshot root
//! - snapshot lifecycle (incomplete marker, atomic `current` alias)
//! - write quiescence through maintenance mode, reversed on every exit path
//! - best-effort execution of the backup steps with failure aggregation
//! - progress output and remote audit entries
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use appliance_backup::config::Config;
//! use appliance_backup::exporter::HelperExporter;
//! use appliance_backup::lock::SystemProcessProbe;
//! use appliance_backup::remote::SshChannel;
//! use appliance_backup::run::BackupRun;
//! use appliance_backup::shutdown::shutdown_signal;
//!
//! # async fn example() -> appliance_backup::Result<()> {
//! let config = Config::from_env()?;
//! let remote = Arc::new(SshChannel::new(&config));
//! let exporter = Arc::new(HelperExporter::new(&config));
//! let report = BackupRun::new(config, remote, exporter, Arc::new(SystemProcessProbe))
//!     .run(shutdown_signal())
//!     .await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`lock`]: run lock marker
//! - [`snapshot`]: snapshot directories and the `current` alias
//! - [`maintenance`]: maintenance mode controller
//! - [`strategy`]: strategy selection and appliance capabilities
//! - [`steps`]: backup steps, plan and failure aggregation
//! - [`report`]: progress and audit reporting
//! - [`run`]: the orchestrator tying it all together

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::path::PathBuf;
use thiserror::Error;

/// Result type for backup orchestration
pub type Result<T> = std::result::Result<T, BackupError>;

/// Fatal errors that end a backup run
///
/// Step failures, maintenance disable failures and integrity findings are not
/// represented here: they are recorded or logged and never abort a run.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Another live backup process holds the run lock
    #[error("a backup may still be running in snapshot {snapshot_id} on PID {pid}")]
    LockConflict {
        /// Snapshot id recorded in the existing marker
        snapshot_id: String,
        /// Process id recorded in the existing marker
        pid: u32,
    },

    /// The lock marker is a symlink left behind by an older release
    #[error("legacy lock marker format at {0}; remove it manually after confirming no backup is running")]
    LegacyLockFormat(PathBuf),

    /// The lock marker exists but cannot be parsed
    #[error("malformed lock marker at {path}: {contents:?}")]
    MalformedLock {
        /// Marker path
        path: PathBuf,
        /// Raw marker contents
        contents: String,
    },

    /// The appliance could not be reached over the remote command channel
    #[error("remote appliance unreachable: {0}")]
    RemoteUnreachable(String),

    /// The appliance version could not be determined
    #[error("failed to query remote appliance version: {0}")]
    VersionQueryFailed(String),

    /// The appliance runs a release older than the minimum supported one
    #[error("unsupported appliance version {found}; at least {minimum} is required")]
    UnsupportedVersion {
        /// Version reported by the appliance
        found: String,
        /// Minimum supported version
        minimum: String,
    },

    /// Strategy override or recorded strategy name is not known
    #[error("invalid backup strategy: {0}")]
    InvalidStrategy(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was interrupted by a signal
    #[error("backup interrupted")]
    Interrupted,

    /// The run panicked; cleanup has still been performed
    #[error("backup aborted unexpectedly: {0}")]
    Panicked(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Environment-style configuration
pub mod config;

/// Remote command channel
pub mod remote;

/// Bulk transfer collaborators
pub mod exporter;

/// Run lock marker
pub mod lock;

/// Snapshot lifecycle
pub mod snapshot;

/// Maintenance mode controller
pub mod maintenance;

/// Strategy selection
pub mod strategy;

/// Backup steps and failure aggregation
pub mod steps;

/// Run reporting
pub mod report;

/// Advisory post-backup checks
pub mod integrity;

/// Run orchestration
pub mod run;

/// Signal handling
pub mod shutdown;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_fatal_error_exits_with_one() {
        let errors = vec![
            BackupError::LockConflict {
                snapshot_id: "20240101T000000".to_string(),
                pid: 42,
            },
            BackupError::LegacyLockFormat(PathBuf::from("/data/in-progress")),
            BackupError::VersionQueryFailed("timeout".to_string()),
            BackupError::Interrupted,
        ];

        for error in errors {
            assert_eq!(error.exit_code(), 1, "{}", error);
        }
    }

    #[test]
    fn test_lock_conflict_message_names_pid() {
        let error = BackupError::LockConflict {
            snapshot_id: "20240101T000000".to_string(),
            pid: 4242,
        };

        assert!(error.to_string().contains("PID 4242"));
        assert!(error.to_string().contains("20240101T000000"));
    }
}
