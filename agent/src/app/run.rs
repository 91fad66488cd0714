//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions, ServerOptions};
use crate::deploy::command::{CommandRunner, TokioCommandRunner};
use crate::deploy::devices::{backend_for, DeviceLocator};
use crate::deploy::flash::FlashOrchestrator;
use crate::deploy::git::SourceFetcher;
use crate::deploy::pipeline::DeploymentPipeline;
use crate::deploy::workspace::WorkspaceCleaner;
use crate::errors::AgentError;
use crate::intake::{EventVerifier, Intake, Job};
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::deployer::{self, JobQueue};

/// Run the daemon until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing tagflash...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start tagflash: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Assemble the deployment pipeline from options against the live system
pub fn build_pipeline(options: &AppOptions) -> DeploymentPipeline {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());

    DeploymentPipeline::new(
        SourceFetcher::new(runner.clone(), options.git.clone()),
        DeviceLocator::new(backend_for(options.device_backend), options.board_family),
        FlashOrchestrator::new(runner, options.flash.clone()),
        WorkspaceCleaner::new(),
        options.pipeline.clone(),
    )
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    info!(
        "Flashing boards {:04x}:{:04x} via {:?} backend, workspaces under {}",
        options.board_family.vendor_id,
        options.board_family.product_id,
        options.device_backend,
        options.pipeline.workspace_base.display()
    );

    let pipeline = Arc::new(build_pipeline(&options));
    let (queue, jobs) = JobQueue::new();

    init_deployer_worker(pipeline, jobs, shutdown_manager, shutdown_tx.subscribe())?;

    let intake = Arc::new(Intake::new(
        EventVerifier::new(options.secret),
        options.repository_url,
    ));
    init_socket_server(
        &options.server,
        ServerState::new(intake, queue),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    Ok(())
}

fn init_deployer_worker(
    pipeline: Arc<DeploymentPipeline>,
    jobs: UnboundedReceiver<Job>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing deployer worker...");

    let deployer_handle = tokio::spawn(async move {
        deployer::run(
            pipeline,
            jobs,
            None,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(deployer_handle)
}

async fn init_socket_server(
    options: &ServerOptions,
    state: ServerState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing HTTP server...");

    let server_handle = serve(options, Arc::new(state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    socket_server_handle: Option<JoinHandle<Result<(), AgentError>>>,
    deployer_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            socket_server_handle: None,
            deployer_worker_handle: None,
        }
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.deployer_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("deployer_handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.socket_server_handle.is_some() {
            return Err(AgentError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down tagflash...");

        // 1. Socket server, so no new deliveries are admitted
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 2. Deployer worker, after the run in progress
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
