//! Backup steps and failure aggregation
//!
//! A run executes a fixed, ordered plan of named steps. A failing step is
//! recorded and the next one starts anyway; the failure-name list is derived
//! from the recorded outcomes at the end.

use crate::exporter::{Domain, ExportError, ExportJob, Exporter, TransferVariant};
use crate::remote::{RemoteChannel, RemoteCommand, RemoteError};
use crate::report::RunReporter;
use crate::snapshot::SnapshotHandle;
use crate::strategy::{Capabilities, Strategy};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors raised by a single step
#[derive(Error, Debug)]
pub enum StepError {
    /// Remote command failed
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Transfer collaborator failed
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Writing the artifact failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a step needs to do its work
pub struct StepContext {
    /// Snapshot being populated; the working directory for every step
    pub snapshot: SnapshotHandle,
    /// Strategy read back from the snapshot
    pub strategy: Strategy,
    /// Remote command channel
    pub remote: Arc<dyn RemoteChannel>,
    /// Transfer collaborator
    pub exporter: Arc<dyn Exporter>,
    /// Most recent complete snapshot
    pub previous_snapshot: Option<PathBuf>,
}

/// One named backup sub-task
#[async_trait]
pub trait BackupStep: Send + Sync {
    /// Name recorded in outcomes and failure lists
    fn name(&self) -> &str;

    /// Progress line shown when the step starts
    fn description(&self) -> String;

    /// Perform the step
    async fn run(&self, ctx: &StepContext) -> Result<(), StepError>;
}

/// Result of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "result", content = "error")]
pub enum StepResult {
    /// Step succeeded
    Success,
    /// Step failed with the given error
    Failure(String),
}

/// Recorded outcome of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step name
    pub name: String,
    /// Success or failure
    #[serde(flatten)]
    pub result: StepResult,
    /// Wall time spent in the step
    pub duration: Duration,
}

impl StepOutcome {
    /// Successful outcome
    pub fn success(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            result: StepResult::Success,
            duration,
        }
    }

    /// Failed outcome
    pub fn failure(name: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            result: StepResult::Failure(error.into()),
            duration,
        }
    }

    /// Whether the step succeeded
    pub fn succeeded(&self) -> bool {
        self.result == StepResult::Success
    }
}

/// Names of failed steps, in execution order
pub fn failure_names(outcomes: &[StepOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|outcome| !outcome.succeeded())
        .map(|outcome| outcome.name.clone())
        .collect()
}

/// Streams a remote export into a file in the snapshot
pub struct RemoteExportStep {
    name: &'static str,
    description: &'static str,
    command: RemoteCommand,
    file: &'static str,
    compress: bool,
}

impl RemoteExportStep {
    /// Export `command` output into `file`
    pub fn new(
        name: &'static str,
        description: &'static str,
        command: RemoteCommand,
        file: &'static str,
    ) -> Self {
        Self {
            name,
            description,
            command,
            file,
            compress: false,
        }
    }

    /// Gzip the output locally
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }
}

#[async_trait]
impl BackupStep for RemoteExportStep {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> String {
        self.description.to_string()
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        let path = ctx.snapshot.path().join(self.file);
        let file = File::create(&path)?;

        let written = if self.compress {
            let mut encoder = GzEncoder::new(file, Compression::default());
            let written = ctx.remote.stream(&self.command, &mut encoder).await?;
            encoder.finish()?.sync_all()?;
            written
        } else {
            let mut file = file;
            let written = ctx.remote.stream(&self.command, &mut file).await?;
            file.sync_all()?;
            written
        };

        debug!(step = self.name, file = self.file, bytes = written, "Export written");
        Ok(())
    }
}

/// Delegates a domain to the transfer collaborator
pub struct TransferStep {
    domain: Domain,
    description: &'static str,
    probe_variant: bool,
}

impl TransferStep {
    /// Transfer `domain`
    pub fn new(domain: Domain, description: &'static str) -> Self {
        Self {
            domain,
            description,
            probe_variant: false,
        }
    }

    /// Probe the appliance for the transfer route when the step runs
    pub fn probing_variant(mut self) -> Self {
        self.probe_variant = true;
        self
    }

    async fn probe(&self, remote: &dyn RemoteChannel) -> TransferVariant {
        match remote
            .run(&RemoteCommand::TransferCapability(self.domain))
            .await
        {
            Ok(answer) if answer.eq_ignore_ascii_case("calculated") => TransferVariant::Calculated,
            Ok(_) => TransferVariant::Legacy,
            Err(e) => {
                debug!(
                    domain = self.domain.as_str(),
                    error = %e,
                    "Capability probe failed, using legacy transfer"
                );
                TransferVariant::Legacy
            }
        }
    }
}

#[async_trait]
impl BackupStep for TransferStep {
    fn name(&self) -> &str {
        self.domain.as_str()
    }

    fn description(&self) -> String {
        self.description.to_string()
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        let variant = if self.probe_variant {
            Some(self.probe(ctx.remote.as_ref()).await)
        } else {
            None
        };

        let job = ExportJob {
            domain: self.domain,
            strategy: ctx.strategy,
            variant,
            snapshot_dir: ctx.snapshot.path().to_path_buf(),
            previous_snapshot: ctx.previous_snapshot.clone(),
        };
        ctx.exporter.export(&job).await?;
        Ok(())
    }
}

/// Ordered step plan for a strategy and appliance capability level
pub fn plan(strategy: Strategy, capabilities: &Capabilities) -> Vec<Box<dyn BackupStep>> {
    let clustered = strategy == Strategy::Cluster;
    let mut steps: Vec<Box<dyn BackupStep>> = vec![
        Box::new(TransferStep::new(Domain::Settings, "Backing up settings ...")),
        Box::new(RemoteExportStep::new(
            "authorized-keys",
            "Backing up SSH authorized keys ...",
            RemoteCommand::ExportAuthorizedKeys,
            "authorized-keys.json",
        )),
        Box::new(RemoteExportStep::new(
            "ssh-host-keys",
            "Backing up SSH host keys ...",
            RemoteCommand::ExportSshHostKeys,
            "ssh-host-keys.tar",
        )),
        Box::new(
            RemoteExportStep::new(
                "mysql",
                "Backing up MySQL database ...",
                RemoteCommand::ExportDatabase,
                "mysql.sql.gz",
            )
            .compressed(),
        ),
        Box::new(RemoteExportStep::new(
            "redis",
            "Backing up Redis database ...",
            RemoteCommand::ExportRedis,
            "redis.rdb",
        )),
    ];

    if capabilities.audit_log {
        steps.push(Box::new(TransferStep::new(Domain::AuditLog, "Backing up audit log ...")));
    }
    if capabilities.hookshot {
        steps.push(Box::new(TransferStep::new(Domain::Hookshot, "Backing up hookshot logs ...")));
    }

    let mut repositories =
        TransferStep::new(Domain::Repositories, "Backing up Git repositories ...");
    if clustered {
        repositories = repositories.probing_variant();
    }
    steps.push(Box::new(repositories));

    steps.push(Box::new(TransferStep::new(Domain::Pages, "Backing up Pages ...")));
    if capabilities.storage {
        let mut storage = TransferStep::new(Domain::Storage, "Backing up storage data ...");
        if clustered {
            storage = storage.probing_variant();
        }
        steps.push(Box::new(storage));
    }
    if capabilities.assets {
        steps.push(Box::new(TransferStep::new(Domain::Assets, "Backing up asset attachments ...")));
    }
    steps.push(Box::new(TransferStep::new(
        Domain::Elasticsearch,
        "Backing up Elasticsearch indices ...",
    )));

    steps
}

/// Executes steps in order without stopping at failures
pub struct StepRunner<'a> {
    ctx: &'a StepContext,
    reporter: &'a RunReporter,
}

impl<'a> StepRunner<'a> {
    /// Runner over a step context
    pub fn new(ctx: &'a StepContext, reporter: &'a RunReporter) -> Self {
        Self { ctx, reporter }
    }

    /// Run one step, converting any failure into a recorded outcome
    pub async fn run(&self, step: &dyn BackupStep) -> StepOutcome {
        self.reporter.step_started(step.name(), &step.description());
        let started = Instant::now();
        match step.run(self.ctx).await {
            Ok(()) => {
                let outcome = StepOutcome::success(step.name(), started.elapsed());
                info!(
                    step = step.name(),
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Step succeeded"
                );
                outcome
            }
            Err(e) => {
                let outcome = StepOutcome::failure(step.name(), e.to_string(), started.elapsed());
                error!(
                    step = step.name(),
                    error = %e,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "Step failed"
                );
                self.reporter.step_failed(step.name(), &e.to_string());
                outcome
            }
        }
    }

    /// Run every step in order, handing each outcome to `record` as it completes
    pub async fn run_all(
        &self,
        steps: &[Box<dyn BackupStep>],
        record: &mut (dyn FnMut(StepOutcome) + Send),
    ) {
        for step in steps {
            let outcome = self.run(step.as_ref()).await;
            record(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ApplianceVersion;
    use pretty_assertions::assert_eq;

    fn names(steps: &[Box<dyn BackupStep>]) -> Vec<String> {
        steps.iter().map(|step| step.name().to_string()).collect()
    }

    #[test]
    fn test_failure_names_preserve_order() {
        let outcomes = vec![
            StepOutcome::success("A", Duration::ZERO),
            StepOutcome::failure("B", "boom", Duration::ZERO),
            StepOutcome::success("C", Duration::ZERO),
            StepOutcome::failure("D", "boom", Duration::ZERO),
        ];
        assert_eq!(failure_names(&outcomes), vec!["B", "D"]);
        assert!(failure_names(&outcomes[..1]).is_empty());
    }

    #[test]
    fn test_standalone_modern_plan() {
        let version = ApplianceVersion::new(2, 13, 0);
        let steps = plan(Strategy::Rsync, &Capabilities::detect(version, Strategy::Rsync));
        assert_eq!(
            names(&steps),
            vec![
                "settings",
                "authorized-keys",
                "ssh-host-keys",
                "mysql",
                "redis",
                "audit-log",
                "hookshot",
                "repositories",
                "pages",
                "storage",
                "elasticsearch",
            ]
        );
    }

    #[test]
    fn test_legacy_plan_backs_up_assets_instead_of_storage() {
        let version = ApplianceVersion::new(2, 11, 0);
        let steps = plan(Strategy::Tarball, &Capabilities::detect(version, Strategy::Tarball));
        let names = names(&steps);
        assert!(names.contains(&"assets".to_string()));
        assert!(!names.contains(&"storage".to_string()));
        assert!(!names.contains(&"audit-log".to_string()));
    }

    #[test]
    fn test_cluster_plan_skips_standalone_only_steps() {
        let version = ApplianceVersion::new(2, 13, 0);
        let steps = plan(Strategy::Cluster, &Capabilities::detect(version, Strategy::Cluster));
        let names = names(&steps);
        assert!(!names.contains(&"audit-log".to_string()));
        assert!(!names.contains(&"hookshot".to_string()));
        assert!(names.contains(&"storage".to_string()));
    }

    #[test]
    fn test_outcome_serializes_result_tag() {
        let outcome = StepOutcome::failure("redis", "exit 1", Duration::from_secs(2));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["result"], "failure");
        assert_eq!(value["error"], "exit 1");
    }
}
