//! Finite state machine for a single deployment run

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::DeployError;

/// A stage a run can fail at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Verifying,
    Routing,
    Fetching,
    Locating,
    Flashing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Verifying => "verifying",
            Stage::Routing => "routing",
            Stage::Fetching => "fetching",
            Stage::Locating => "locating",
            Stage::Flashing => "flashing",
        };
        f.write_str(name)
    }
}

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Waiting for a request
    Idle,

    /// Checking the signature and decoding the payload
    Verifying,

    /// Deciding whether the event should deploy
    Routing,

    /// Cloning and checking out the tag
    Fetching,

    /// Enumerating attached boards
    Locating,

    /// Running the flash tool per board
    Flashing,

    /// Removing the workspace
    CleaningUp,

    Succeeded,

    Failed(Stage),
}

impl PipelineState {
    /// Whether the run has concluded
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed(_))
    }

    /// The stage this state corresponds to, if it is one of the working stages
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Verifying => Some(Stage::Verifying),
            PipelineState::Routing => Some(Stage::Routing),
            PipelineState::Fetching => Some(Stage::Fetching),
            PipelineState::Locating => Some(Stage::Locating),
            PipelineState::Flashing => Some(Stage::Flashing),
            _ => None,
        }
    }
}

/// Pipeline event
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A request arrived
    Receive,

    /// Signature and payload checked out
    Verified,

    /// The event is eligible and its run may start fetching
    Dispatch,

    /// The workspace is checked out at the tag
    Fetched,

    /// At least one matching board was found
    Located,

    /// Every board was flashed
    Flashed,

    /// The current stage failed
    StageFailed(DeployError),

    /// The workspace is gone
    CleanedUp,

    /// Return a concluded run to idle
    Reset,
}

/// Deployment run FSM
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    state: PipelineState,
    error: Option<DeployError>,
    failed_stage: Option<Stage>,
    last_stage: Option<Stage>,
}

impl PipelineFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            error: None,
            failed_stage: None,
            last_stage: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Error that ended (or is ending) the run, if any
    pub fn error(&self) -> Option<&DeployError> {
        self.error.as_ref()
    }

    /// The furthest working stage the run entered
    pub fn stage_reached(&self) -> Option<Stage> {
        self.last_stage
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PipelineEvent) -> Result<PipelineState, String> {
        let new_state = match (&self.state, event) {
            (PipelineState::Idle, PipelineEvent::Receive) => PipelineState::Verifying,

            (PipelineState::Verifying, PipelineEvent::Verified) => PipelineState::Routing,
            (PipelineState::Routing, PipelineEvent::Dispatch) => PipelineState::Fetching,

            // Nothing exists on disk yet, so intake failures conclude directly
            (PipelineState::Verifying | PipelineState::Routing, PipelineEvent::StageFailed(err)) => {
                let stage = self.state.stage().unwrap_or(Stage::Verifying);
                self.failed_stage = Some(stage);
                self.error = Some(err);
                PipelineState::Failed(stage)
            }

            (PipelineState::Fetching, PipelineEvent::Fetched) => PipelineState::Locating,
            (PipelineState::Locating, PipelineEvent::Located) => PipelineState::Flashing,
            (PipelineState::Flashing, PipelineEvent::Flashed) => PipelineState::CleaningUp,

            // Once fetching has begun, every failure goes through cleanup
            (
                PipelineState::Fetching | PipelineState::Locating | PipelineState::Flashing,
                PipelineEvent::StageFailed(err),
            ) => {
                self.failed_stage = self.state.stage();
                self.error = Some(err);
                PipelineState::CleaningUp
            }

            (PipelineState::CleaningUp, PipelineEvent::CleanedUp) => match self.failed_stage {
                Some(stage) => PipelineState::Failed(stage),
                None => PipelineState::Succeeded,
            },

            (PipelineState::Succeeded | PipelineState::Failed(_), PipelineEvent::Reset) => {
                self.error = None;
                self.failed_stage = None;
                self.last_stage = None;
                PipelineState::Idle
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        if let Some(stage) = new_state.stage() {
            self.last_stage = Some(stage);
        }
        self.state = new_state;
        Ok(new_state)
    }

    /// Process a transition the caller sequences itself; an invalid one is
    /// logged and leaves the state unchanged.
    pub fn apply(&mut self, event: PipelineEvent) {
        if let Err(e) = self.process(event) {
            error!("Pipeline state machine: {}", e);
        }
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}
