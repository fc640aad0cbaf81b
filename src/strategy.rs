//! Strategy selection and appliance capabilities
//!
//! The strategy is resolved once per run, persisted verbatim into the
//! snapshot, and every later dispatch reads the persisted value.

use crate::config::Config;
use crate::remote::{RemoteChannel, RemoteCommand, RemoteError};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// File inside the snapshot recording the strategy
pub const STRATEGY_FILE: &str = "strategy";

/// File inside the snapshot recording the appliance version
pub const VERSION_FILE: &str = "version";

/// Appliance topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Single node appliance
    Standalone,
    /// Multi node cluster
    Clustered,
}

/// Backup strategy variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Standalone, online incremental transfer
    Rsync,
    /// Standalone, archive transfer that needs write quiescence
    Tarball,
    /// Clustered appliance
    Cluster,
}

impl Strategy {
    /// Name persisted into the snapshot
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Tarball => "tarball",
            Self::Cluster => "cluster",
        }
    }

    /// Topology this strategy applies to
    pub fn topology(&self) -> Topology {
        match self {
            Self::Rsync | Self::Tarball => Topology::Standalone,
            Self::Cluster => Topology::Clustered,
        }
    }

    /// Whether writes must be paused for the duration of the backup
    pub fn requires_quiescence(&self) -> bool {
        matches!(self, Self::Tarball)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rsync" => Ok(Self::Rsync),
            "tarball" => Ok(Self::Tarball),
            "cluster" => Ok(Self::Cluster),
            other => Err(BackupError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Appliance release version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplianceVersion {
    /// Major release
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Patch release
    pub patch: u32,
}

impl ApplianceVersion {
    /// Create a version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `major.minor[.patch]`, ignoring a leading `v` and any pre-release suffix
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().trim_start_matches('v');
        let core = value.split(|c: char| c == '-' || c == '+').next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(part) => part.parse().ok()?,
            None => 0,
        };
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for ApplianceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version reported by the appliance, kept verbatim for the snapshot record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVersion {
    /// Raw version string
    pub raw: String,
    /// Parsed version
    pub version: ApplianceVersion,
}

/// Release from which object storage replaced legacy assets
const STORAGE_RELEASE: ApplianceVersion = ApplianceVersion::new(2, 12, 0);

/// Optional backup domains available on this appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Audit log indices can be backed up separately
    pub audit_log: bool,
    /// Webhook delivery logs can be backed up separately
    pub hookshot: bool,
    /// Object storage is in use
    pub storage: bool,
    /// Legacy asset storage is in use
    pub assets: bool,
}

impl Capabilities {
    /// Capabilities implied by an appliance version and strategy
    pub fn detect(version: ApplianceVersion, strategy: Strategy) -> Self {
        let standalone = strategy.topology() == Topology::Standalone;
        let modern = version >= STORAGE_RELEASE;
        Self {
            audit_log: standalone && modern,
            hookshot: standalone && modern,
            storage: modern,
            assets: !modern,
        }
    }
}

/// Query the appliance version
pub async fn query_version(remote: &dyn RemoteChannel) -> Result<RemoteVersion> {
    let raw = remote
        .run(&RemoteCommand::Version)
        .await
        .map_err(|e| match e {
            RemoteError::Unreachable(reason) => BackupError::RemoteUnreachable(reason),
            other => BackupError::VersionQueryFailed(other.to_string()),
        })?;
    let version = ApplianceVersion::parse(&raw)
        .ok_or_else(|| BackupError::VersionQueryFailed(format!("unrecognised version {:?}", raw)))?;
    Ok(RemoteVersion { raw, version })
}

/// Resolves the strategy once per run
pub struct StrategySelector<'a> {
    remote: &'a dyn RemoteChannel,
    override_strategy: Option<Strategy>,
}

impl<'a> StrategySelector<'a> {
    /// Create a selector honouring the configured override
    pub fn new(remote: &'a dyn RemoteChannel, config: &Config) -> Self {
        Self {
            remote,
            override_strategy: config.strategy_override,
        }
    }

    /// Determine the strategy, querying the appliance unless overridden
    pub async fn resolve(&self) -> Result<Strategy> {
        if let Some(strategy) = self.override_strategy {
            info!(strategy = %strategy, "Using strategy override");
            return Ok(strategy);
        }

        let clustered = self
            .remote
            .run(&RemoteCommand::ClusterEnabled)
            .await
            .map_err(|e| match e {
                RemoteError::Unreachable(reason) => BackupError::RemoteUnreachable(reason),
                other => BackupError::RemoteUnreachable(other.to_string()),
            })?;

        let strategy = if parse_flag(&clustered) {
            Strategy::Cluster
        } else {
            Strategy::Rsync
        };
        info!(strategy = %strategy, "Resolved backup strategy");
        Ok(strategy)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Record the strategy in the snapshot
pub async fn persist(snapshot_dir: &Path, strategy: Strategy) -> Result<()> {
    fs::write(snapshot_dir.join(STRATEGY_FILE), format!("{}\n", strategy)).await?;
    Ok(())
}

/// Read the strategy recorded in a snapshot
pub async fn load(snapshot_dir: &Path) -> Result<Strategy> {
    let raw = fs::read_to_string(snapshot_dir.join(STRATEGY_FILE)).await?;
    raw.parse()
}

/// Record the appliance version in the snapshot
pub async fn persist_version(snapshot_dir: &Path, version: &RemoteVersion) -> Result<()> {
    fs::write(snapshot_dir.join(VERSION_FILE), format!("{}\n", version.raw)).await?;
    Ok(())
}
