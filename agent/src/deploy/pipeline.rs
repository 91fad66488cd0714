//! Deployment pipeline
//!
//! Drives an admitted [`Job`] from Fetching to a terminal state. Stages run
//! in order and the first failure stops them; the workspace is released from
//! a single place after the stages return.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::deploy::devices::DeviceLocator;
use crate::deploy::flash::FlashOrchestrator;
use crate::deploy::fsm::{PipelineEvent, PipelineFsm};
use crate::deploy::git::SourceFetcher;
use crate::deploy::report::RunResult;
use crate::deploy::workspace::{
    workspace_path, workspace_root, Workspace, WorkspaceCleaner, WorkspaceLease,
};
use crate::errors::{DeployError, FetchError};
use crate::filesys::dir::Dir;
use crate::intake::event::DeploymentEvent;
use crate::intake::Job;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Base directory; workspaces go in its `tagflash/` subdirectory
    pub workspace_base: PathBuf,

    /// Clone attempts per run, at least 1
    pub clone_attempts: u32,

    /// Delay between clone attempts
    pub clone_backoff: CooldownOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workspace_base: std::env::temp_dir(),
            clone_attempts: 1,
            clone_backoff: CooldownOptions::default(),
        }
    }
}

/// Fetch, locate, flash, clean up
pub struct DeploymentPipeline {
    fetcher: SourceFetcher,
    locator: DeviceLocator,
    orchestrator: FlashOrchestrator,
    cleaner: WorkspaceCleaner,
    options: PipelineOptions,
}

impl DeploymentPipeline {
    pub fn new(
        fetcher: SourceFetcher,
        locator: DeviceLocator,
        orchestrator: FlashOrchestrator,
        cleaner: WorkspaceCleaner,
        options: PipelineOptions,
    ) -> Self {
        Self {
            fetcher,
            locator,
            orchestrator,
            cleaner,
            options,
        }
    }

    /// Workspace directory a run for `event` would use
    pub fn workspace_for(&self, event: &DeploymentEvent) -> PathBuf {
        workspace_path(&self.options.workspace_base, event.repository_url())
    }

    /// Run a job to completion. Never fails; the outcome is in the result.
    pub async fn run(&self, job: Job) -> RunResult {
        let Job {
            run_id,
            event,
            mut fsm,
            accepted_at,
        } = job;

        let mut result = RunResult::new(
            run_id.clone(),
            Some(event.reference().to_string()),
            accepted_at,
        );

        fsm.apply(PipelineEvent::Dispatch);
        info!(
            run_id = %run_id,
            reference = %event.reference(),
            delivery = ?event.delivery_id(),
            "Starting deployment of {}",
            event.repository_url()
        );

        let lease = WorkspaceLease::new(self.workspace_for(&event));

        if let Err(err) = self.run_stages(&event, &lease, &mut fsm, &mut result).await {
            warn!(run_id = %run_id, stage = %err.stage(), "Stage failed: {}", err);
            fsm.apply(PipelineEvent::StageFailed(err));
        }

        if let Err(err) = self.cleaner.release(lease).await {
            warn!(run_id = %run_id, "{}", err);
            result.set_cleanup_error(err);
        }
        fsm.apply(PipelineEvent::CleanedUp);

        result.conclude(&fsm);
        result
    }

    async fn run_stages(
        &self,
        event: &DeploymentEvent,
        lease: &WorkspaceLease,
        fsm: &mut PipelineFsm,
        result: &mut RunResult,
    ) -> Result<(), DeployError> {
        let workspace = self.fetch(event, lease.path()).await?;
        fsm.apply(PipelineEvent::Fetched);

        let devices = self.locator.locate().await?;
        fsm.apply(PipelineEvent::Located);

        self.orchestrator
            .flash_all(&workspace, &devices, result)
            .await?;
        fsm.apply(PipelineEvent::Flashed);

        Ok(())
    }

    async fn fetch(&self, event: &DeploymentEvent, path: &Path) -> Result<Workspace, FetchError> {
        let clone_error = |reason: String| FetchError::Clone {
            url: event.repository_url().to_string(),
            reason,
        };

        Dir::new(workspace_root(&self.options.workspace_base))
            .create()
            .await
            .map_err(|e| clone_error(e.to_string()))?;

        // Runs are serialized and the root is ours, so anything already here
        // was left by a process that died mid-run
        if Dir::new(path).exists().await {
            warn!("Evicting stale workspace {}", path.display());
            self.cleaner
                .remove(path)
                .await
                .map_err(|e| clone_error(e.to_string()))?;
        }

        let max_attempts = self.options.clone_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .fetcher
                .fetch(event.repository_url(), event.reference(), path)
                .await
            {
                Err(err @ FetchError::Clone { .. }) if attempt < max_attempts => {
                    let delay = calc_exp_backoff(&self.options.clone_backoff, attempt - 1);
                    warn!(
                        "Clone attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, max_attempts, err, delay
                    );
                    self.cleaner
                        .remove(path)
                        .await
                        .map_err(|e| clone_error(e.to_string()))?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
