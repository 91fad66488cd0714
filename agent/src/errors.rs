//! Error types for tagflash
//!
//! `AgentError` covers process-level concerns (configuration, server,
//! shutdown). Everything a deployment run can fail with is modelled per
//! component and gathered into [`DeployError`], whose [`DeployError::stage`]
//! attributes the failure to exactly one pipeline stage.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::deploy::fsm::Stage;

/// Main error type for the daemon
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures while authenticating and decoding an inbound notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("unsupported event kind: {0:?}")]
    UnsupportedEventKind(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Failures while materializing the repository at a tag.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to clone {url}: {reason}")]
    Clone { url: String, reason: String },

    #[error("ref {reference:?} not found: {reason}")]
    RefNotFound { reference: String, reason: String },

    #[error("failed to check out {commit}: {reason}")]
    Checkout { commit: String, reason: String },
}

/// Failures while discovering attached boards.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    #[error("{backend} enumeration failed: {reason}")]
    Enumeration { backend: String, reason: String },

    #[error("no device found matching {vendor_id:04x}:{product_id:04x}")]
    NoDeviceFound { vendor_id: u16, product_id: u16 },
}

/// Why a single flash invocation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashFailure {
    #[error("flash tool exited with status {}", describe_exit(.code))]
    Exit { code: Option<i32> },

    #[error("flash tool could not be launched: {0}")]
    Launch(String),

    #[error("flash tool timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("lost track of the flash tool: {0}")]
    Wait(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

/// A flash invocation failed for one device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("flashing {device} failed: {cause}")]
pub struct FlashError {
    pub device: String,
    pub cause: FlashFailure,
}

/// The workspace could not be removed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to remove workspace {}: {reason}", .path.display())]
pub struct CleanupError {
    pub path: PathBuf,
    pub reason: String,
}

/// Failures of the command-execution seam itself (not of the command).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("failed waiting for {program}: {reason}")]
    Wait { program: String, reason: String },
}

/// Any failure that ends a deployment run before it succeeds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error("ref {reference:?} of kind {ref_kind} is not eligible for deployment")]
    NotEligible { ref_kind: String, reference: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Flash(#[from] FlashError),
}

impl DeployError {
    /// The pipeline stage this error is attributed to
    pub fn stage(&self) -> Stage {
        match self {
            DeployError::Intake(_) => Stage::Verifying,
            DeployError::NotEligible { .. } => Stage::Routing,
            DeployError::Fetch(_) => Stage::Fetching,
            DeployError::Locate(_) => Stage::Locating,
            DeployError::Flash(_) => Stage::Flashing,
        }
    }

    /// Intake and routing rejections end a run quietly; they are not failures
    /// an operator needs to act on.
    pub fn is_silent(&self) -> bool {
        matches!(self, DeployError::Intake(_) | DeployError::NotEligible { .. })
    }
}
