// Shared fakes for orchestrator integration tests
#![allow(dead_code)]

use appliance_backup::config::Config;
use appliance_backup::exporter::{Domain, ExportError, ExportJob, Exporter};
use appliance_backup::lock::ProcessProbe;
use appliance_backup::remote::{RemoteChannel, RemoteCommand, RemoteError};
use appliance_backup::report::RunReporter;
use appliance_backup::run::BackupRun;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const HOSTNAME: &str = "backup.example.com";
pub const PID: u32 = 4242;

/// Ordered log of everything the fakes were asked to do
pub type Events = Arc<Mutex<Vec<String>>>;

pub fn started_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()
}

pub struct FakeRemote {
    events: Events,
    version: Mutex<String>,
    clustered: Mutex<bool>,
    unreachable: Mutex<bool>,
    failing: Mutex<Vec<RemoteCommand>>,
    stall_once: Mutex<Option<RemoteCommand>>,
    completed: Mutex<Vec<RemoteCommand>>,
    pub stalled: Arc<Notify>,
}

impl FakeRemote {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            version: Mutex::new("2.13.0".to_string()),
            clustered: Mutex::new(false),
            unreachable: Mutex::new(false),
            failing: Mutex::new(Vec::new()),
            stall_once: Mutex::new(None),
            completed: Mutex::new(Vec::new()),
            stalled: Arc::new(Notify::new()),
        }
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock() = version.to_string();
    }

    pub fn set_clustered(&self, clustered: bool) {
        *self.clustered.lock() = clustered;
    }

    pub fn set_unreachable(&self) {
        *self.unreachable.lock() = true;
    }

    pub fn fail(&self, command: RemoteCommand) {
        self.failing.lock().push(command);
    }

    /// The first invocation of `command` never answers and wakes `stalled`
    pub fn stall_once(&self, command: RemoteCommand) {
        *self.stall_once.lock() = Some(command);
    }

    /// Number of invocations of `command` that ran to completion
    pub fn completed(&self, command: &RemoteCommand) -> usize {
        self.completed.lock().iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl RemoteChannel for FakeRemote {
    async fn stream(
        &self,
        command: &RemoteCommand,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, RemoteError> {
        self.events.lock().push(command.command_line());
        if *self.unreachable.lock() {
            return Err(RemoteError::Unreachable("connection refused".to_string()));
        }
        let stall = {
            let mut stall_once = self.stall_once.lock();
            if stall_once.as_ref() == Some(command) {
                stall_once.take();
                true
            } else {
                false
            }
        };
        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        if self.failing.lock().contains(command) {
            return Err(RemoteError::Failed {
                command: command.command_line(),
                status: Some(1),
                stderr: "export failed".to_string(),
            });
        }

        let output = match command {
            RemoteCommand::Version => self.version.lock().clone(),
            RemoteCommand::ClusterEnabled => self.clustered.lock().to_string(),
            RemoteCommand::PendingWrites => "0".to_string(),
            RemoteCommand::TransferCapability(_) => "calculated".to_string(),
            RemoteCommand::AuditLog(_)
            | RemoteCommand::MaintenanceEnable
            | RemoteCommand::MaintenanceDisable => String::new(),
            _ => "dump".to_string(),
        };
        sink.write_all(output.as_bytes())?;
        self.completed.lock().push(command.clone());
        Ok(output.len() as u64)
    }
}

pub struct FakeExporter {
    events: Events,
    pub jobs: Mutex<Vec<ExportJob>>,
    failing: Mutex<HashSet<Domain>>,
    contents: Mutex<HashMap<Domain, String>>,
    hang_on: Mutex<Option<Domain>>,
    panic_on: Mutex<Option<Domain>>,
    fsck_fails: Mutex<bool>,
    pub hanging: Arc<Notify>,
}

impl FakeExporter {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            jobs: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            contents: Mutex::new(HashMap::new()),
            hang_on: Mutex::new(None),
            panic_on: Mutex::new(None),
            fsck_fails: Mutex::new(false),
            hanging: Arc::new(Notify::new()),
        }
    }

    pub fn fail(&self, domain: Domain) {
        self.failing.lock().insert(domain);
    }

    pub fn write(&self, domain: Domain, contents: &str) {
        self.contents.lock().insert(domain, contents.to_string());
    }

    pub fn hang_on(&self, domain: Domain) {
        *self.hang_on.lock() = Some(domain);
    }

    pub fn panic_on(&self, domain: Domain) {
        *self.panic_on.lock() = Some(domain);
    }

    pub fn fail_fsck(&self) {
        *self.fsck_fails.lock() = true;
    }

    pub fn job(&self, domain: Domain) -> Option<ExportJob> {
        self.jobs.lock().iter().find(|job| job.domain == domain).cloned()
    }
}

#[async_trait]
impl Exporter for FakeExporter {
    async fn export(&self, job: &ExportJob) -> Result<(), ExportError> {
        self.events.lock().push(format!("export {}", job.domain.as_str()));
        self.jobs.lock().push(job.clone());

        let hang = *self.hang_on.lock() == Some(job.domain);
        if hang {
            self.hanging.notify_one();
            std::future::pending::<()>().await;
        }
        if *self.panic_on.lock() == Some(job.domain) {
            panic!("transfer helper crashed");
        }
        if self.failing.lock().contains(&job.domain) {
            return Err(ExportError::Failed {
                task: job.domain.as_str().to_string(),
                status: Some(1),
            });
        }

        let contents = self
            .contents
            .lock()
            .get(&job.domain)
            .cloned()
            .unwrap_or_else(|| "ok".to_string());
        std::fs::write(
            job.snapshot_dir.join(format!("{}.txt", job.domain.as_str())),
            contents,
        )
        .map_err(|source| ExportError::Spawn {
            task: job.domain.as_str().to_string(),
            source,
        })?;
        Ok(())
    }

    async fn fsck(&self, _snapshot_dir: &Path) -> Result<(), ExportError> {
        self.events.lock().push("fsck".to_string());
        if *self.fsck_fails.lock() {
            return Err(ExportError::Failed {
                task: "fsck".to_string(),
                status: Some(2),
            });
        }
        Ok(())
    }
}

/// Treats exactly the listed pids as live backup processes
#[derive(Default)]
pub struct FakeProbe {
    alive: HashSet<u32>,
}

impl FakeProbe {
    pub fn alive(pids: &[u32]) -> Self {
        Self {
            alive: pids.iter().copied().collect(),
        }
    }
}

impl ProcessProbe for FakeProbe {
    fn is_backup_process(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

/// In-memory progress output
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub root: TempDir,
    pub events: Events,
    pub remote: Arc<FakeRemote>,
    pub exporter: Arc<FakeExporter>,
    pub output: Captured,
}

impl Harness {
    pub fn new() -> Self {
        let events: Events = Arc::default();
        Self {
            root: tempfile::tempdir().unwrap(),
            remote: Arc::new(FakeRemote::new(events.clone())),
            exporter: Arc::new(FakeExporter::new(events.clone())),
            events,
            output: Captured::default(),
        }
    }

    pub fn config(&self) -> Config {
        Config::new(HOSTNAME)
            .with_data_dir(self.root.path())
            .with_drain_poll_interval(Duration::from_millis(1))
    }

    pub fn backup(&self, config: Config, probe: FakeProbe) -> BackupRun {
        let reporter = RunReporter::new(HOSTNAME, self.remote.clone())
            .with_output(Box::new(self.output.clone()));
        BackupRun::new(config, self.remote.clone(), self.exporter.clone(), Arc::new(probe))
            .with_reporter(reporter)
            .with_clock(started_at)
            .with_pid(PID)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| e.as_str() == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e.as_str() == event)
    }

    pub fn last_position(&self, prefix: &str) -> Option<usize> {
        self.events.lock().iter().rposition(|e| e.starts_with(prefix))
    }

    pub fn first_position(&self, prefix: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e.starts_with(prefix))
    }

    pub fn lock_path(&self) -> std::path::PathBuf {
        self.root.path().join("in-progress")
    }
}

/// Shutdown future that never fires
pub async fn never() {
    std::future::pending::<()>().await
}
