//! Run reporting
//!
//! Human-readable progress goes to the reporter's output (stderr by default);
//! start and completion are also written to the appliance audit log. A failure
//! to report never affects the run.

use crate::remote::{RemoteChannel, RemoteCommand};
use crate::run::RunReport;
use crate::snapshot::{SnapshotId, SnapshotStatus};
use crate::strategy::Strategy;
use chrono::Utc;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Emits progress, status and audit entries for a run
pub struct RunReporter {
    hostname: String,
    remote: Arc<dyn RemoteChannel>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl RunReporter {
    /// Reporter writing to stderr
    pub fn new(hostname: impl Into<String>, remote: Arc<dyn RemoteChannel>) -> Self {
        Self {
            hostname: hostname.into(),
            remote,
            out: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Redirect human-readable output
    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = Mutex::new(out);
        self
    }

    /// Announce the start of a run
    pub async fn start(&self, snapshot_id: &SnapshotId, strategy: Strategy) {
        self.line(&format!(
            "Starting backup of {} with strategy {} in snapshot {}",
            self.hostname, strategy, snapshot_id
        ));
        self.audit(format!(
            "Starting backup of {} in snapshot {}",
            self.hostname, snapshot_id
        ))
        .await;
    }

    /// Free-form progress line
    pub fn progress(&self, message: &str) {
        self.line(message);
    }

    /// Progress line for a step that is starting
    pub fn step_started(&self, name: &str, description: &str) {
        info!(step = name, "Starting step");
        self.line(description);
    }

    /// Note a failed step
    pub fn step_failed(&self, name: &str, error: &str) {
        self.line(&format!("Error: {} failed: {}", name, error));
    }

    /// Announce the end of a finalized run
    pub async fn complete(&self, report: &RunReport) {
        let failures = report.failures();
        match report.status {
            SnapshotStatus::Complete => {
                self.line(&format!(
                    "Completed backup of {} in snapshot {} at {}",
                    self.hostname,
                    report.snapshot_id,
                    Utc::now().format("%H:%M:%S")
                ));
                self.audit(format!(
                    "Completed backup of {} in snapshot {} successfully",
                    self.hostname, report.snapshot_id
                ))
                .await;
            }
            SnapshotStatus::Incomplete => {
                let joined = failures.join(", ");
                self.line(&format!(
                    "Error: Snapshot {} incomplete. Some steps failed at {}.",
                    report.snapshot_id,
                    Utc::now().format("%H:%M:%S")
                ));
                self.line(&format!("Failed steps: {}", joined));
                self.audit(format!(
                    "Completed backup of {} in snapshot {} with failures: {}",
                    self.hostname, report.snapshot_id, joined
                ))
                .await;
            }
        }
    }

    /// Announce an interrupted run
    pub fn interrupted(&self, snapshot_id: &SnapshotId) {
        self.line(&format!(
            "Backup of {} interrupted; snapshot {} left incomplete",
            self.hostname, snapshot_id
        ));
    }

    /// Advisory finding from a post-backup check
    pub fn integrity_warning(&self, check: &str, message: &str) {
        self.line(&format!("Warning: {} check: {}", check, message));
    }

    fn line(&self, message: &str) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{}", message).and_then(|_| out.flush()) {
            warn!(error = %e, "Failed to write progress output");
        }
    }

    async fn audit(&self, message: String) {
        if let Err(e) = self.remote.run(&RemoteCommand::AuditLog(message)).await {
            warn!(error = %e, "Failed to write audit log entry");
        }
    }
}
