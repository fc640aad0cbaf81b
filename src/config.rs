//! Environment-style configuration for a backup run

use crate::strategy::{ApplianceVersion, Strategy};
use crate::{BackupError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a backup run
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname of the appliance being backed up
    pub hostname: String,
    /// Snapshot root holding `in-progress`, `current` and the snapshot directories
    pub data_dir: PathBuf,
    /// Port of the remote command channel
    pub ssh_port: u16,
    /// User on the remote command channel
    pub ssh_user: String,
    /// Extra arguments passed to every ssh invocation
    pub extra_ssh_opts: Vec<String>,
    /// Niceness for locally spawned collaborators
    pub nice: Option<i32>,
    /// ionice arguments for locally spawned collaborators, e.g. `-c 3`
    pub ionice: Option<Vec<String>>,
    /// Run the advisory repository fsck after the backup
    pub fsck: bool,
    /// Operator override of the strategy
    pub strategy_override: Option<Strategy>,
    /// Directory holding the `backup-<domain>` transfer helpers
    pub helper_dir: PathBuf,
    /// Poll interval while waiting for writes to drain
    pub drain_poll_interval: Duration,
    /// Oldest appliance release this tool can back up
    pub min_version: ApplianceVersion,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            data_dir: PathBuf::from("data"),
            ssh_port: 122,
            ssh_user: "admin".to_string(),
            extra_ssh_opts: Vec::new(),
            nice: None,
            ionice: None,
            fsck: false,
            strategy_override: None,
            helper_dir: PathBuf::from("libexec"),
            drain_poll_interval: Duration::from_secs(5),
            min_version: ApplianceVersion::new(2, 10, 0),
        }
    }
}

impl Config {
    /// Create a configuration for the given appliance
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `BACKUP_*` environment variables
    pub fn from_env() -> Result<Self> {
        let hostname = env::var("BACKUP_HOSTNAME")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| BackupError::Config("BACKUP_HOSTNAME is required".to_string()))?;

        let defaults = Self::default();
        let strategy_override = match env::var("BACKUP_STRATEGY") {
            Ok(value) if !value.trim().is_empty() => Some(value.parse::<Strategy>()?),
            _ => None,
        };
        let min_version = match env::var("BACKUP_MIN_VERSION") {
            Ok(value) => ApplianceVersion::parse(&value).ok_or_else(|| {
                BackupError::Config(format!("BACKUP_MIN_VERSION is not a version: {}", value))
            })?,
            Err(_) => defaults.min_version,
        };

        Ok(Self {
            hostname,
            data_dir: env::var("BACKUP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            ssh_port: parse_env("BACKUP_SSH_PORT").unwrap_or(defaults.ssh_port),
            ssh_user: env_or_default("BACKUP_SSH_USER", &defaults.ssh_user),
            extra_ssh_opts: split_args(&env::var("BACKUP_EXTRA_SSH_OPTS").unwrap_or_default()),
            nice: parse_env("BACKUP_NICE"),
            ionice: env::var("BACKUP_IONICE")
                .ok()
                .map(|value| split_args(&value))
                .filter(|args| !args.is_empty()),
            fsck: env::var("BACKUP_FSCK")
                .ok()
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            strategy_override,
            helper_dir: env::var("BACKUP_HELPER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.helper_dir),
            drain_poll_interval: Duration::from_secs(
                parse_env("BACKUP_DRAIN_POLL_SECS").unwrap_or(5),
            ),
            min_version,
        })
    }

    /// Set the snapshot root
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Force a strategy instead of querying the appliance
    pub fn with_strategy_override(mut self, strategy: Strategy) -> Self {
        self.strategy_override = Some(strategy);
        self
    }

    /// Enable or disable the post-backup fsck
    pub fn with_fsck(mut self, enabled: bool) -> Self {
        self.fsck = enabled;
        self
    }

    /// Set the write drain poll interval
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Set the minimum supported appliance version
    pub fn with_min_version(mut self, version: ApplianceVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Set local process throttling
    pub fn with_throttle(mut self, nice: Option<i32>, ionice: Option<Vec<String>>) -> Self {
        self.nice = nice;
        self.ionice = ionice;
        self
    }

    /// Prefix applied to locally spawned collaborator commands
    pub fn throttle_prefix(&self) -> Vec<String> {
        let mut prefix = Vec::new();
        if let Some(nice) = self.nice {
            prefix.push("nice".to_string());
            prefix.push("-n".to_string());
            prefix.push(nice.to_string());
        }
        if let Some(ionice) = &self.ionice {
            prefix.push("ionice".to_string());
            prefix.extend(ionice.iter().cloned());
        }
        prefix
    }
}

fn env_or_default(key: &str, default_value: &str) -> String {
    env::var(key).unwrap_or_else(|_| default_value.to_string())
}

fn parse_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}
