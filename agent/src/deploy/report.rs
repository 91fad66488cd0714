//! Per-run results

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::deploy::devices::Device;
use crate::deploy::fsm::{PipelineFsm, PipelineState, Stage};
use crate::errors::{CleanupError, DeployError, FlashError};

/// Result of flashing one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOutcome {
    pub device: Device,
    pub succeeded: bool,
    pub error: Option<FlashError>,
    pub attempts: u32,
}

/// Terminal status of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    InProgress,
    Succeeded,
    Failed { stage: Stage, error: DeployError },
}

/// Everything that happened during one run.
///
/// Outcomes can only be appended while the run is in progress.
#[derive(Debug, Clone)]
pub struct RunResult {
    run_id: String,
    reference: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    stage: Option<Stage>,
    outcomes: Vec<FlashOutcome>,
    status: RunStatus,
    cleanup_error: Option<CleanupError>,
}

impl RunResult {
    pub fn new(run_id: String, reference: Option<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            reference,
            started_at,
            finished_at: None,
            stage: None,
            outcomes: Vec::new(),
            status: RunStatus::InProgress,
            cleanup_error: None,
        }
    }

    /// Build a result for a run whose FSM already reached a terminal state
    pub fn concluded(
        run_id: String,
        reference: Option<String>,
        started_at: DateTime<Utc>,
        fsm: &PipelineFsm,
    ) -> Self {
        let mut result = Self::new(run_id, reference, started_at);
        result.conclude(fsm);
        result
    }

    /// Append a flash outcome
    pub fn record(&mut self, outcome: FlashOutcome) {
        if self.status != RunStatus::InProgress {
            warn!(run_id = %self.run_id, "Ignoring flash outcome for a concluded run");
            return;
        }
        self.outcomes.push(outcome);
    }

    pub(crate) fn set_cleanup_error(&mut self, error: CleanupError) {
        self.cleanup_error = Some(error);
    }

    /// Copy the terminal state of `fsm` into this result
    pub fn conclude(&mut self, fsm: &PipelineFsm) {
        self.stage = fsm.stage_reached();
        self.status = match (fsm.state(), fsm.error()) {
            (PipelineState::Succeeded, _) => RunStatus::Succeeded,
            (PipelineState::Failed(stage), Some(error)) => RunStatus::Failed {
                stage,
                error: error.clone(),
            },
            _ => RunStatus::InProgress,
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Furthest working stage the run entered
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn outcomes(&self) -> &[FlashOutcome] {
        &self.outcomes
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn cleanup_error(&self) -> Option<&CleanupError> {
        self.cleanup_error.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Emit the structured log line operators use to follow deployments
pub fn log_run_result(result: &RunResult) {
    let flashed = result.outcomes().iter().filter(|o| o.succeeded).count();
    let elapsed_ms = result
        .finished_at()
        .map(|end| (end - result.started_at()).num_milliseconds());

    match result.status() {
        RunStatus::Succeeded => info!(
            run_id = %result.run_id(),
            reference = ?result.reference(),
            flashed,
            elapsed_ms,
            "Deployment succeeded"
        ),
        RunStatus::Failed { stage, error } if error.is_silent() => info!(
            run_id = %result.run_id(),
            reference = ?result.reference(),
            stage = %stage,
            "Delivery ignored: {}",
            error
        ),
        RunStatus::Failed { stage, error } => error!(
            run_id = %result.run_id(),
            reference = ?result.reference(),
            stage = %stage,
            flashed,
            attempted = result.outcomes().len(),
            elapsed_ms,
            "Deployment failed: {}",
            error
        ),
        RunStatus::InProgress => warn!(
            run_id = %result.run_id(),
            "Run reported before it concluded"
        ),
    }

    if let Some(err) = result.cleanup_error() {
        warn!(run_id = %result.run_id(), "Workspace cleanup failed: {}", err);
    }
}
