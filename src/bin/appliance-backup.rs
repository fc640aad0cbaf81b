use anyhow::Context;
use appliance_backup::config::Config;
use appliance_backup::exporter::HelperExporter;
use appliance_backup::lock::{SystemProcessProbe, LOCK_FILE};
use appliance_backup::remote::SshChannel;
use appliance_backup::run::BackupRun;
use appliance_backup::shutdown::shutdown_signal;
use appliance_backup::BackupError;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
appliance-backup: snapshot backup of a remote appliance

USAGE:
    appliance-backup [OPTIONS]

OPTIONS:
    -h, --help           Print this help message and exit
    -v, --version        Print version and exit

REQUIRED ENVIRONMENT VARIABLES:
    BACKUP_HOSTNAME          Appliance to back up

OPTIONAL ENVIRONMENT VARIABLES (default shown):
    BACKUP_DATA_DIR          Snapshot root                         [data]
    BACKUP_SSH_PORT          Remote command channel port           [122]
    BACKUP_SSH_USER          Remote user                           [admin]
    BACKUP_EXTRA_SSH_OPTS    Extra ssh arguments
    BACKUP_NICE              Niceness for local transfer helpers
    BACKUP_IONICE            ionice arguments for local helpers, e.g. \"-c 3\"
    BACKUP_FSCK              Run the advisory repository fsck      [false]
    BACKUP_STRATEGY          rsync | tarball | cluster             [ask the appliance]
    BACKUP_HELPER_DIR        Directory of backup-<domain> helpers  [libexec]
    BACKUP_DRAIN_POLL_SECS   Write drain poll interval             [5]
    BACKUP_MIN_VERSION       Oldest supported appliance release    [2.10.0]
    RUST_LOG                 Diagnostic log filter

EXIT STATUS:
    0 when every step succeeded, 1 otherwise.
";

/// Returns true when a usage flag was handled and the process should exit.
fn handle_cli_flags() -> bool {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{}", USAGE);
                return true;
            }
            "-v" | "--version" => {
                println!("appliance-backup {}", APP_VERSION);
                return true;
            }
            _ => {}
        }
    }
    false
}

#[tokio::main]
async fn main() {
    if handle_cli_flags() {
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let config = Config::from_env().context("invalid configuration")?;
    let lock_path = config.data_dir.join(LOCK_FILE);

    let remote = Arc::new(SshChannel::new(&config));
    let exporter = Arc::new(HelperExporter::new(&config));
    let backup = BackupRun::new(config, remote, exporter, Arc::new(SystemProcessProbe));

    match backup.run(shutdown_signal()).await {
        Ok(report) => Ok(report.exit_code()),
        Err(e) => {
            match &e {
                BackupError::LockConflict { .. } => eprintln!(
                    "Error: a backup is already in progress. If no backup is running, remove {} and retry.",
                    lock_path.display()
                ),
                BackupError::LegacyLockFormat(path) => eprintln!(
                    "Error: {} uses an old lock format. Make sure no backup is running, then remove it.",
                    path.display()
                ),
                _ => eprintln!("Error: {}", e),
            }
            Ok(e.exit_code())
        }
    }
}
