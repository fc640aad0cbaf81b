//! Run orchestration
//!
//! `Locked → SnapshotOpen → StrategyResolved → (MaintenanceEngaged) →
//! StepsExecuted → (MaintenanceDisengaged) → Finalized → Unlocked`
//!
//! The body of the run is raced against the shutdown signal and guarded
//! against panics. Whichever way it ends, the same cleanup path runs exactly
//! once: maintenance mode is disabled if this run enabled it, then the lock
//! marker is released if it still names this run.

use crate::config::Config;
use crate::exporter::Exporter;
use crate::integrity::{CredentialScan, FsckCheck, IntegrityCheck};
use crate::lock::{LockManager, LockMarker, ProcessProbe};
use crate::maintenance::{MaintenanceController, MaintenanceState};
use crate::remote::RemoteChannel;
use crate::report::RunReporter;
use crate::snapshot::{SnapshotId, SnapshotManager, SnapshotStatus};
use crate::steps::{self, failure_names, StepContext, StepOutcome, StepRunner};
use crate::strategy::{self, Capabilities, Strategy, StrategySelector};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Outcome name recorded when maintenance mode cannot be engaged
pub const MAINTENANCE_STEP: &str = "maintenance-mode";

/// States a run passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Lock marker written
    Locked,
    /// Snapshot directory created and marked incomplete
    SnapshotOpen,
    /// Strategy resolved and persisted
    StrategyResolved,
    /// Maintenance mode engaged
    MaintenanceEngaged,
    /// Every planned step has run
    StepsExecuted,
    /// Maintenance mode disabled
    MaintenanceDisengaged,
    /// Snapshot finalized
    Finalized(SnapshotStatus),
    /// Lock marker released
    Unlocked,
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Still executing
    Running,
    /// Finalized with zero failures
    Complete,
    /// Finalized with failures, or never finalized
    Incomplete,
}

impl From<SnapshotStatus> for RunStatus {
    fn from(status: SnapshotStatus) -> Self {
        match status {
            SnapshotStatus::Complete => Self::Complete,
            SnapshotStatus::Incomplete => Self::Incomplete,
        }
    }
}

/// Mutable record of one execution
#[derive(Debug, Clone)]
pub struct Run {
    /// Snapshot this run writes into
    pub snapshot_id: SnapshotId,
    /// Owning process
    pub pid: u32,
    /// Strategy, once resolved
    pub strategy: Option<Strategy>,
    /// Step outcomes in execution order
    pub outcomes: Vec<StepOutcome>,
    /// Overall status
    pub status: RunStatus,
    /// Maintenance mode as driven by this run
    pub maintenance: MaintenanceState,
    /// Phases entered so far
    pub phases: Vec<RunPhase>,
}

impl Run {
    fn new(snapshot_id: SnapshotId, pid: u32) -> Self {
        Self {
            snapshot_id,
            pid,
            strategy: None,
            outcomes: Vec::new(),
            status: RunStatus::Running,
            maintenance: MaintenanceState::Disengaged,
            phases: Vec::new(),
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!(snapshot_id = %self.snapshot_id, phase = ?phase, "Run phase");
        self.phases.push(phase);
    }

    /// Names of failed steps so far
    pub fn failures(&self) -> Vec<String> {
        failure_names(&self.outcomes)
    }
}

type SharedRun = Arc<Mutex<Run>>;

/// Result of a run that reached finalization
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Snapshot written by the run
    pub snapshot_id: SnapshotId,
    /// Strategy recorded in the snapshot
    pub strategy: Strategy,
    /// Step outcomes in execution order
    pub outcomes: Vec<StepOutcome>,
    /// Terminal snapshot state
    pub status: SnapshotStatus,
    /// Phases the run went through, cleanup included
    pub phases: Vec<RunPhase>,
    /// Advisory post-backup findings
    pub integrity_warnings: Vec<String>,
}

impl RunReport {
    /// Names of failed steps, in execution order
    pub fn failures(&self) -> Vec<String> {
        failure_names(&self.outcomes)
    }

    /// Process exit code: 0 on full success, 1 if any step failed
    pub fn exit_code(&self) -> i32 {
        if self.failures().is_empty() {
            0
        } else {
            1
        }
    }
}

/// Reverses everything the run acquired, exactly once
struct RunCleanup {
    locks: LockManager,
    marker: LockMarker,
    maintenance: MaintenanceController,
    done: AtomicBool,
}

impl RunCleanup {
    fn new(locks: LockManager, marker: LockMarker, maintenance: MaintenanceController) -> Self {
        Self {
            locks,
            marker,
            maintenance,
            done: AtomicBool::new(false),
        }
    }

    async fn run(&self, run: &SharedRun) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.maintenance.disable().await {
            let mut run = run.lock();
            run.maintenance = self.maintenance.state();
            run.enter(RunPhase::MaintenanceDisengaged);
        }

        match self.locks.release(&self.marker) {
            Ok(_) => run.lock().enter(RunPhase::Unlocked),
            Err(e) => error!(error = %e, "Failed to release backup lock"),
        }
    }
}

impl Drop for RunCleanup {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        // Only reached when the run future is dropped before cleanup could be awaited.
        // No remote call can be made from here, so only the lock is released.
        if self.maintenance.state().needs_disable() {
            error!("Run dropped with maintenance mode still engaged; disable it manually");
        }
        if let Err(e) = self.locks.release(&self.marker) {
            error!(error = %e, "Failed to release backup lock");
        }
    }
}

/// One backup of one appliance
pub struct BackupRun {
    config: Config,
    remote: Arc<dyn RemoteChannel>,
    exporter: Arc<dyn Exporter>,
    probe: Arc<dyn ProcessProbe>,
    reporter: RunReporter,
    checks: Vec<Box<dyn IntegrityCheck>>,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    pid: u32,
}

impl BackupRun {
    /// Prepare a run against the configured appliance
    pub fn new(
        config: Config,
        remote: Arc<dyn RemoteChannel>,
        exporter: Arc<dyn Exporter>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let reporter = RunReporter::new(config.hostname.clone(), remote.clone());
        let mut checks: Vec<Box<dyn IntegrityCheck>> = vec![Box::new(CredentialScan::new())];
        if config.fsck {
            checks.push(Box::new(FsckCheck::new(exporter.clone())));
        }

        Self {
            config,
            remote,
            exporter,
            probe,
            reporter,
            checks,
            clock: Box::new(Utc::now),
            pid: std::process::id(),
        }
    }

    /// Replace the reporter
    pub fn with_reporter(mut self, reporter: RunReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replace the post-backup checks
    pub fn with_integrity_checks(mut self, checks: Vec<Box<dyn IntegrityCheck>>) -> Self {
        self.checks = checks;
        self
    }

    /// Clock used for the snapshot identifier
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Process identity recorded in the lock marker
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Execute the run until it finishes or `shutdown` resolves
    ///
    /// Returns the report of a run that reached finalization, whether or not
    /// every step succeeded. Lock conflicts, fatal remote errors, interrupts and
    /// panics are returned as errors after cleanup has run.
    ///
    /// The returned future must be driven to completion. Dropping it early
    /// skips the awaited cleanup: the lock is still released, but maintenance
    /// mode is left for the operator to disable.
    #[instrument(skip_all, fields(host = %self.config.hostname))]
    pub async fn run<S>(self, shutdown: S) -> Result<RunReport>
    where
        S: Future<Output = ()>,
    {
        let snapshots = SnapshotManager::new(&self.config.data_dir);
        snapshots.ensure_root().await?;
        let id = snapshots.next_id((self.clock)()).await?;

        let marker = LockMarker::new(id.as_str(), self.pid);
        let locks = LockManager::new(snapshots.root(), self.probe.clone());
        locks.acquire(&marker)?;

        let run: SharedRun = Arc::new(Mutex::new(Run::new(id.clone(), self.pid)));
        run.lock().enter(RunPhase::Locked);

        let maintenance =
            MaintenanceController::new(self.remote.clone(), self.config.drain_poll_interval);
        let cleanup = RunCleanup::new(locks, marker, maintenance.clone());

        let outcome = {
            let execute =
                AssertUnwindSafe(self.execute(&snapshots, id.clone(), &run, &maintenance))
                    .catch_unwind();
            tokio::pin!(shutdown);
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!(snapshot_id = %id, "Interrupt received, cleaning up");
                    Err(BackupError::Interrupted)
                }
                result = execute => match result {
                    Ok(result) => result,
                    Err(panic) => Err(BackupError::Panicked(panic_message(panic.as_ref()))),
                },
            }
        };

        cleanup.run(&run).await;

        match outcome {
            Ok(mut report) => {
                report.phases = run.lock().phases.clone();
                Ok(report)
            }
            Err(e) => {
                if matches!(e, BackupError::Interrupted) {
                    self.reporter.interrupted(&id);
                }
                error!(snapshot_id = %id, error = %e, "Backup run aborted");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        snapshots: &SnapshotManager,
        id: SnapshotId,
        run: &SharedRun,
        maintenance: &MaintenanceController,
    ) -> Result<RunReport> {
        let handle = snapshots.begin(id).await?;
        run.lock().enter(RunPhase::SnapshotOpen);

        let version = strategy::query_version(self.remote.as_ref()).await?;
        strategy::persist_version(handle.path(), &version).await?;
        info!(version = %version.raw, "Appliance version");
        if version.version < self.config.min_version {
            return Err(BackupError::UnsupportedVersion {
                found: version.raw,
                minimum: self.config.min_version.to_string(),
            });
        }

        let resolved = StrategySelector::new(self.remote.as_ref(), &self.config)
            .resolve()
            .await?;
        strategy::persist(handle.path(), resolved).await?;
        // Dispatch on what the snapshot records, the same value a restore will see
        let strategy = strategy::load(handle.path()).await?;
        {
            let mut run = run.lock();
            run.strategy = Some(strategy);
            run.enter(RunPhase::StrategyResolved);
        }

        self.reporter.start(handle.id(), strategy).await;

        if strategy.requires_quiescence() {
            self.reporter.progress("Enabling maintenance mode ...");
            let started = Instant::now();
            let enabled = maintenance.enable().await;
            let mut run = run.lock();
            run.maintenance = maintenance.state();
            match enabled {
                Ok(()) => run.enter(RunPhase::MaintenanceEngaged),
                Err(e) => {
                    error!(error = %e, "Failed to engage maintenance mode");
                    self.reporter.step_failed(MAINTENANCE_STEP, &e.to_string());
                    run.outcomes.push(StepOutcome::failure(
                        MAINTENANCE_STEP,
                        e.to_string(),
                        started.elapsed(),
                    ));
                }
            }
        }

        let ctx = StepContext {
            snapshot: handle.clone(),
            strategy,
            remote: self.remote.clone(),
            exporter: self.exporter.clone(),
            previous_snapshot: snapshots.current_path().await?,
        };
        let plan = steps::plan(strategy, &Capabilities::detect(version.version, strategy));
        StepRunner::new(&ctx, &self.reporter)
            .run_all(&plan, &mut |outcome: StepOutcome| run.lock().outcomes.push(outcome))
            .await;
        run.lock().enter(RunPhase::StepsExecuted);

        if maintenance.state().needs_disable() {
            self.reporter.progress("Disabling maintenance mode ...");
            maintenance.disable().await;
            let mut run = run.lock();
            run.maintenance = maintenance.state();
            run.enter(RunPhase::MaintenanceDisengaged);
        }

        let (failures, outcomes) = {
            let run = run.lock();
            (run.failures(), run.outcomes.clone())
        };
        let status = snapshots.finalize(&handle, &failures).await?;
        {
            let mut run = run.lock();
            run.status = status.into();
            run.enter(RunPhase::Finalized(status));
        }

        let mut report = RunReport {
            snapshot_id: handle.id().clone(),
            strategy,
            outcomes,
            status,
            phases: Vec::new(),
            integrity_warnings: Vec::new(),
        };
        self.reporter.complete(&report).await;

        for check in &self.checks {
            if let Err(e) = check.check(handle.path()).await {
                warn!(check = check.name(), error = %e, "Post-backup check failed");
                self.reporter.integrity_warning(check.name(), &e.to_string());
                report
                    .integrity_warnings
                    .push(format!("{}: {}", check.name(), e));
            }
        }

        Ok(report)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_follows_failures() {
        let mut report = RunReport {
            snapshot_id: SnapshotId::parse("20240101T000000").unwrap(),
            strategy: Strategy::Rsync,
            outcomes: vec![StepOutcome::success("mysql", Default::default())],
            status: SnapshotStatus::Complete,
            phases: Vec::new(),
            integrity_warnings: vec!["credential-scan: findings".to_string()],
        };
        assert_eq!(report.exit_code(), 0);

        report
            .outcomes
            .push(StepOutcome::failure("redis", "exit 1", Default::default()));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures(), vec!["redis".to_string()]);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "panic");
    }
}
