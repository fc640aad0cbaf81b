//! Remote command channel to the appliance
//!
//! Every interaction with the appliance (exports, version query, audit log,
//! maintenance mode) is a named [`RemoteCommand`] executed over a
//! [`RemoteChannel`]. Failures surface as a non-zero completion status.

use crate::config::Config;
use crate::exporter::Domain;
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status ssh uses for connection level failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Errors from the remote command channel
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The appliance could not be reached at all
    #[error("appliance unreachable: {0}")]
    Unreachable(String),

    /// The command ran but completed with a failure status
    #[error("remote command `{command}` failed with status {status:?}: {stderr}")]
    Failed {
        /// Remote command line
        command: String,
        /// Exit status, if the command exited normally
        status: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Local IO error while streaming output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named operations understood by the appliance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Report the appliance release version
    Version,
    /// Report whether the appliance runs as a cluster
    ClusterEnabled,
    /// Dump the authorized keys as JSON
    ExportAuthorizedKeys,
    /// Dump the SSH host keys as a tar archive
    ExportSshHostKeys,
    /// Dump the relational database
    ExportDatabase,
    /// Dump the key-value store
    ExportRedis,
    /// Write an entry into the appliance audit log
    AuditLog(String),
    /// Enable maintenance mode
    MaintenanceEnable,
    /// Disable maintenance mode
    MaintenanceDisable,
    /// Report the number of writes still in flight
    PendingWrites,
    /// Report whether calculated-route transfers are available for a domain
    TransferCapability(Domain),
}

impl RemoteCommand {
    /// Command line executed on the appliance
    pub fn command_line(&self) -> String {
        match self {
            Self::Version => "appliance-version".to_string(),
            Self::ClusterEnabled => "appliance-config --get cluster.enabled".to_string(),
            Self::ExportAuthorizedKeys => "appliance-export-authorized-keys".to_string(),
            Self::ExportSshHostKeys => "appliance-export-ssh-host-keys".to_string(),
            Self::ExportDatabase => "appliance-export-database".to_string(),
            Self::ExportRedis => "appliance-export-redis".to_string(),
            Self::AuditLog(message) => {
                format!("appliance-audit-logger -t backup-utils -- {}", shell_quote(message))
            }
            Self::MaintenanceEnable => "appliance-maintenance --enable".to_string(),
            Self::MaintenanceDisable => "appliance-maintenance --disable".to_string(),
            Self::PendingWrites => "appliance-maintenance --pending-writes".to_string(),
            Self::TransferCapability(domain) => {
                format!("appliance-transfer-capability {}", domain.as_str())
            }
        }
    }
}

/// Transport used to invoke remote operations
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Execute a command, streaming its standard output into `sink`
    ///
    /// Returns the number of bytes written.
    async fn stream(
        &self,
        command: &RemoteCommand,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, RemoteError>;

    /// Execute a command and return its trimmed standard output
    async fn run(&self, command: &RemoteCommand) -> Result<String, RemoteError> {
        let mut output = Vec::new();
        self.stream(command, &mut output).await?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }
}

/// Remote channel over `ssh`
pub struct SshChannel {
    host: String,
    port: u16,
    user: String,
    extra_opts: Vec<String>,
}

impl SshChannel {
    /// Create a channel to the configured appliance
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.hostname.clone(),
            port: config.ssh_port,
            user: config.ssh_user.clone(),
            extra_opts: config.extra_ssh_opts.clone(),
        }
    }

    fn args(&self, command: &RemoteCommand) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        args.extend(self.extra_opts.iter().cloned());
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".to_string());
        args.push(command.command_line());
        args
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn stream(
        &self,
        command: &RemoteCommand,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, RemoteError> {
        let command_line = command.command_line();
        debug!(host = %self.host, command = %command_line, "Running remote command");

        let mut child = Command::new("ssh")
            .args(self.args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Unreachable(format!("failed to spawn ssh: {}", e)))?;

        // Drain stderr concurrently so a chatty command cannot block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });

        let mut total = 0u64;
        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let read = stdout.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                sink.write_all(&buf[..read])?;
                total += read as u64;
            }
        }
        sink.flush()?;

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match status.code() {
            Some(0) => Ok(total),
            Some(SSH_CONNECTION_FAILURE) => Err(RemoteError::Unreachable(stderr)),
            code => Err(RemoteError::Failed {
                command: command_line,
                status: code,
                stderr,
            }),
        }
    }
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_audit_command_quotes_message() {
        let command = RemoteCommand::AuditLog("Starting backup of host's data".to_string());
        assert_eq!(
            command.command_line(),
            r"appliance-audit-logger -t backup-utils -- 'Starting backup of host'\''s data'"
        );
    }

    #[test]
    fn test_ssh_args_target_configured_host() {
        let mut config = Config::new("appliance.example.com");
        config.extra_ssh_opts = vec!["-i".to_string(), "/keys/backup".to_string()];
        let channel = SshChannel::new(&config);

        let args = channel.args(&RemoteCommand::Version);
        assert_eq!(
            args,
            vec![
                "-p",
                "122",
                "-o",
                "BatchMode=yes",
                "-i",
                "/keys/backup",
                "admin@appliance.example.com",
                "--",
                "appliance-version",
            ]
        );
    }

    #[test]
    fn test_capability_probe_names_domain() {
        assert_eq!(
            RemoteCommand::TransferCapability(Domain::Storage).command_line(),
            "appliance-transfer-capability storage"
        );
    }
}
