//! Maintenance mode controller
//!
//! `Disengaged --enable()--> Engaged --disable()--> Disengaged`. The state is
//! shared between the run and its cleanup path. `disable()` never reaches the
//! appliance when this run did not enable maintenance mode itself, and the
//! state only returns to `Disengaged` once a disable request has completed.

use crate::remote::{RemoteChannel, RemoteCommand, RemoteError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Maintenance mode as driven by this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    /// Not enabled by this run
    Disengaged,
    /// Enable requested, writes still draining
    Engaging,
    /// Enabled and quiescent
    Engaged,
    /// Disable sent, not yet acknowledged
    Disengaging,
}

impl MaintenanceState {
    /// Whether this run owes the appliance a disable
    pub fn needs_disable(&self) -> bool {
        !matches!(self, Self::Disengaged)
    }
}

/// Enables and disables maintenance mode on the appliance
#[derive(Clone)]
pub struct MaintenanceController {
    remote: Arc<dyn RemoteChannel>,
    state: Arc<Mutex<MaintenanceState>>,
    poll_interval: Duration,
}

impl MaintenanceController {
    /// Controller over `remote`, polling the write drain every `poll_interval`
    pub fn new(remote: Arc<dyn RemoteChannel>, poll_interval: Duration) -> Self {
        Self {
            remote,
            state: Arc::new(Mutex::new(MaintenanceState::Disengaged)),
            poll_interval,
        }
    }

    /// Current state
    pub fn state(&self) -> MaintenanceState {
        *self.state.lock()
    }

    /// Enable maintenance mode and wait for outstanding writes to drain
    ///
    /// The state moves to `Engaging` before the appliance is contacted, so an
    /// interrupt arriving mid-enable still triggers a disable during cleanup.
    #[instrument(skip(self))]
    pub async fn enable(&self) -> Result<(), RemoteError> {
        {
            let mut state = self.state.lock();
            if state.needs_disable() {
                return Ok(());
            }
            *state = MaintenanceState::Engaging;
        }

        info!("Enabling maintenance mode");
        self.remote.run(&RemoteCommand::MaintenanceEnable).await?;
        self.wait_for_drain().await?;

        let mut state = self.state.lock();
        if *state == MaintenanceState::Engaging {
            *state = MaintenanceState::Engaged;
        }
        info!("Maintenance mode engaged");
        Ok(())
    }

    /// Disable maintenance mode if this run enabled it
    ///
    /// Returns whether the appliance was asked to disable. Failures are logged
    /// and swallowed: the appliance may already be recovering on its own.
    ///
    /// If the returned future is dropped before the appliance answers, the
    /// state stays `Disengaging` and the next call sends the request again.
    #[instrument(skip(self))]
    pub async fn disable(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.needs_disable() {
                return false;
            }
            *state = MaintenanceState::Disengaging;
        }

        match self.remote.run(&RemoteCommand::MaintenanceDisable).await {
            Ok(_) => info!("Maintenance mode disabled"),
            Err(e) => warn!(error = %e, "Failed to disable maintenance mode"),
        }
        *self.state.lock() = MaintenanceState::Disengaged;
        true
    }

    async fn wait_for_drain(&self) -> Result<(), RemoteError> {
        loop {
            let output = self.remote.run(&RemoteCommand::PendingWrites).await?;
            let pending: u64 = output.trim().parse().map_err(|_| RemoteError::Failed {
                command: RemoteCommand::PendingWrites.command_line(),
                status: Some(0),
                stderr: format!("unexpected pending write count {:?}", output),
            })?;
            if pending == 0 {
                return Ok(());
            }
            info!(pending = pending, "Waiting for writes to drain");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
