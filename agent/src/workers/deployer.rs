//! Deployment worker
//!
//! The only consumer of the job queue. Jobs are run one at a time in the order
//! they were accepted, so at most one workspace and one flash tool exist at
//! any moment.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::deploy::pipeline::DeploymentPipeline;
use crate::deploy::report::{log_run_result, RunResult};
use crate::errors::AgentError;
use crate::intake::Job;

/// Producer half of the run-admission queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: UnboundedSender<Job>,
}

impl JobQueue {
    /// Create the queue and the receiver the worker drains
    pub fn new() -> (Self, UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a job. Only fails once the worker has stopped.
    pub fn submit(&self, job: Job) -> Result<(), AgentError> {
        let run_id = job.run_id.clone();
        self.tx
            .send(job)
            .map_err(|_| AgentError::Internal(format!("deployer stopped, run {} dropped", run_id)))?;
        debug!(run_id = %run_id, "Deployment queued");
        Ok(())
    }
}

/// Run the deployer worker.
///
/// Each finished [`RunResult`] is logged and, when `reports` is set, sent on.
/// Shutdown is only observed between runs; a run in progress completes.
pub async fn run(
    pipeline: Arc<DeploymentPipeline>,
    mut jobs: UnboundedReceiver<Job>,
    reports: Option<UnboundedSender<RunResult>>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Deployer worker starting...");

    loop {
        let job = tokio::select! {
            biased;

            _ = &mut shutdown_signal => {
                info!("Deployer worker shutting down...");
                break;
            }
            job = jobs.recv() => match job {
                Some(job) => job,
                None => {
                    info!("Job queue closed, deployer worker exiting");
                    return;
                }
            },
        };

        let result = pipeline.run(job).await;
        log_run_result(&result);

        if let Some(reports) = &reports {
            let _ = reports.send(result);
        }
    }

    jobs.close();
    let mut discarded = 0;
    while jobs.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        warn!("Discarded {} queued deployment(s) at shutdown", discarded);
    }
}
