//! Bulk transfer collaborators
//!
//! Repository, pages, storage and search-index transfers are opaque to the
//! orchestrator. Each one is handed an [`ExportJob`] and either succeeds or
//! fails as a whole.

use crate::config::Config;
use crate::strategy::Strategy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from a transfer collaborator
#[derive(Error, Debug)]
pub enum ExportError {
    /// The collaborator completed with a failure status
    #[error("{task} exited with status {status:?}")]
    Failed {
        /// Task name
        task: String,
        /// Exit status, if the process exited normally
        status: Option<i32>,
    },

    /// The collaborator could not be started
    #[error("failed to start {task}: {source}")]
    Spawn {
        /// Task name
        task: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

/// Backup domains delegated to transfer collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    /// Appliance settings export
    Settings,
    /// Audit log indices
    AuditLog,
    /// Webhook delivery logs
    Hookshot,
    /// Git repositories
    Repositories,
    /// Static pages sites
    Pages,
    /// Object storage
    Storage,
    /// Legacy asset storage
    Assets,
    /// Search indices
    Elasticsearch,
}

impl Domain {
    /// Name used for helpers, step names and remote probes
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::AuditLog => "audit-log",
            Self::Hookshot => "hookshot",
            Self::Repositories => "repositories",
            Self::Pages => "pages",
            Self::Storage => "storage",
            Self::Assets => "assets",
            Self::Elasticsearch => "elasticsearch",
        }
    }
}

/// Transfer route for domains that support more than one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferVariant {
    /// Routes calculated by the appliance
    Calculated,
    /// Per-item legacy transfer
    Legacy,
}

impl TransferVariant {
    /// Name passed to collaborators
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calculated => "calculated",
            Self::Legacy => "legacy",
        }
    }
}

/// One unit of work for a transfer collaborator
#[derive(Debug, Clone)]
pub struct ExportJob {
    /// Domain being backed up
    pub domain: Domain,
    /// Strategy recorded in the snapshot
    pub strategy: Strategy,
    /// Probed transfer route, for domains that have one
    pub variant: Option<TransferVariant>,
    /// Snapshot directory to write into
    pub snapshot_dir: PathBuf,
    /// Most recent complete snapshot, usable as an incremental base
    pub previous_snapshot: Option<PathBuf>,
}

/// Collaborator that performs bulk transfers
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Transfer one domain into the snapshot
    async fn export(&self, job: &ExportJob) -> Result<(), ExportError>;

    /// Verify repositories in a finished snapshot
    async fn fsck(&self, snapshot_dir: &Path) -> Result<(), ExportError>;
}

/// Runs `backup-<domain>` helper executables from the helper directory
pub struct HelperExporter {
    hostname: String,
    helper_dir: PathBuf,
    throttle: Vec<String>,
}

impl HelperExporter {
    /// Create an exporter for the configured appliance
    pub fn new(config: &Config) -> Self {
        Self {
            hostname: config.hostname.clone(),
            helper_dir: config.helper_dir.clone(),
            throttle: config.throttle_prefix(),
        }
    }

    fn command(&self, task: &str, snapshot_dir: &Path) -> Command {
        let helper = self.helper_dir.join(format!("backup-{}", task));
        let mut command = match self.throttle.split_first() {
            Some((program, rest)) => {
                let mut command = Command::new(program);
                command.args(rest).arg(&helper);
                command
            }
            None => Command::new(&helper),
        };
        command
            .current_dir(snapshot_dir)
            .env("BACKUP_HOSTNAME", &self.hostname)
            .env("BACKUP_SNAPSHOT_DIR", snapshot_dir)
            .kill_on_drop(true);
        command
    }

    async fn execute(&self, task: &str, mut command: Command) -> Result<(), ExportError> {
        debug!(task = task, "Starting transfer helper");
        let status = command.status().await.map_err(|source| ExportError::Spawn {
            task: task.to_string(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(ExportError::Failed {
                task: task.to_string(),
                status: status.code(),
            })
        }
    }
}

#[async_trait]
impl Exporter for HelperExporter {
    async fn export(&self, job: &ExportJob) -> Result<(), ExportError> {
        let task = job.domain.as_str();
        let mut command = self.command(task, &job.snapshot_dir);
        command.env("BACKUP_STRATEGY", job.strategy.as_str());
        if let Some(variant) = job.variant {
            command.env("BACKUP_TRANSFER_VARIANT", variant.as_str());
        }
        if let Some(previous) = &job.previous_snapshot {
            command.env("BACKUP_PREVIOUS_SNAPSHOT", previous);
        }
        self.execute(task, command).await
    }

    async fn fsck(&self, snapshot_dir: &Path) -> Result<(), ExportError> {
        let command = self.command("fsck", snapshot_dir);
        self.execute("fsck", command).await
    }
}
