//! Flashing boards with the external upload tool

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::deploy::command::{CommandRunner, CommandSpec};
use crate::deploy::devices::Device;
use crate::deploy::report::{FlashOutcome, RunResult};
use crate::deploy::workspace::Workspace;
use crate::errors::{CommandError, FlashError, FlashFailure};
use crate::utils::{calc_exp_backoff, tail_lines, CooldownOptions};

/// Placeholder replaced with the device identifier in the tool arguments
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Lines of tool stderr kept in the log when an upload fails
const STDERR_TAIL_LINES: usize = 20;

/// What to do with the remaining boards after one fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashPolicy {
    /// Stop at the first failure
    #[default]
    FailFast,

    /// Try every board; the run still fails if any board failed
    AttemptAll,
}

impl std::str::FromStr for FlashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "fail-fast" | "failfast" => Ok(FlashPolicy::FailFast),
            "attempt-all" | "attemptall" => Ok(FlashPolicy::AttemptAll),
            _ => Err(format!("Invalid flash policy: {}", s)),
        }
    }
}

/// Flash tool invocation settings
#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub program: String,

    /// Arguments; `{port}` is replaced with the device identifier
    pub args: Vec<String>,

    /// Limit for a single invocation
    pub timeout: Duration,

    /// Invocations per device, at least 1
    pub attempts: u32,

    /// Delay between attempts on the same device
    pub backoff: CooldownOptions,

    pub policy: FlashPolicy,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            program: "pio".to_string(),
            args: ["run", "-t", "upload", "--upload-port", PORT_PLACEHOLDER]
                .into_iter()
                .map(str::to_string)
                .collect(),
            timeout: Duration::from_secs(600),
            attempts: 1,
            backoff: CooldownOptions::default(),
            policy: FlashPolicy::default(),
        }
    }
}

/// Runs the flash tool once per board, in order
pub struct FlashOrchestrator {
    runner: Arc<dyn CommandRunner>,
    options: FlashOptions,
}

impl FlashOrchestrator {
    pub fn new(runner: Arc<dyn CommandRunner>, options: FlashOptions) -> Self {
        Self { runner, options }
    }

    pub fn policy(&self) -> FlashPolicy {
        self.options.policy
    }

    /// Flash every device from `workspace`, recording one outcome per device
    /// attempted. Returns the first failure.
    pub async fn flash_all(
        &self,
        workspace: &Workspace,
        devices: &[Device],
        result: &mut RunResult,
    ) -> Result<(), FlashError> {
        let mut first_failure = None;

        for (index, device) in devices.iter().enumerate() {
            let outcome = self.flash_device(workspace, device).await;
            let failure = outcome.error.clone();
            result.record(outcome);

            let Some(err) = failure else {
                continue;
            };
            if self.options.policy == FlashPolicy::FailFast {
                let skipped = devices.len() - index - 1;
                if skipped > 0 {
                    warn!("Skipping {} remaining device(s) after failure", skipped);
                }
                return Err(err);
            }
            first_failure.get_or_insert(err);
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn flash_device(&self, workspace: &Workspace, device: &Device) -> FlashOutcome {
        let max_attempts = self.options.attempts.max(1);
        let mut attempt = 1;

        loop {
            info!(
                device = %device.identifier,
                attempt,
                "Flashing {} at {}",
                workspace.reference(),
                workspace.commit()
            );

            match self.invoke(workspace, device).await {
                Ok(()) => {
                    info!(device = %device.identifier, "Flashed successfully");
                    return FlashOutcome {
                        device: device.clone(),
                        succeeded: true,
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(cause) if attempt < max_attempts => {
                    let delay = calc_exp_backoff(&self.options.backoff, attempt - 1);
                    warn!(
                        device = %device.identifier,
                        "Flash attempt {}/{} failed: {}, retrying in {:?}",
                        attempt,
                        max_attempts,
                        cause,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(cause) => {
                    let err = FlashError {
                        device: device.identifier.clone(),
                        cause,
                    };
                    error!(device = %device.identifier, "{}", err);
                    return FlashOutcome {
                        device: device.clone(),
                        succeeded: false,
                        error: Some(err),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn invoke(&self, workspace: &Workspace, device: &Device) -> Result<(), FlashFailure> {
        let spec = CommandSpec::new(
            self.options.program.as_str(),
            substitute_port(&self.options.args, &device.identifier),
        )
        .current_dir(workspace.path())
        .timeout(self.options.timeout);

        match self.runner.run(&spec).await {
            Ok(output) if output.success() => {
                debug!(device = %device.identifier, "{}", tail_lines(&output.stdout, STDERR_TAIL_LINES));
                Ok(())
            }
            Ok(output) => {
                let tail = tail_lines(&output.stderr, STDERR_TAIL_LINES);
                if !tail.is_empty() {
                    warn!(device = %device.identifier, "Flash tool stderr:\n{}", tail);
                }
                Err(FlashFailure::Exit { code: output.code })
            }
            Err(CommandError::TimedOut { timeout, .. }) => Err(FlashFailure::TimedOut(timeout)),
            Err(CommandError::Launch { reason, .. }) => Err(FlashFailure::Launch(reason)),
            Err(CommandError::Wait { reason, .. }) => Err(FlashFailure::Wait(reason)),
        }
    }
}

/// Replace every `{port}` in `args` with `port`
pub fn substitute_port(args: &[String], port: &str) -> Vec<String> {
    args.iter()
        .map(|arg| arg.replace(PORT_PLACEHOLDER, port))
        .collect()
}
