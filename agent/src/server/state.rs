//! Server state

use std::sync::Arc;

use crate::intake::Intake;
use crate::workers::deployer::JobQueue;

/// Server state shared across handlers
pub struct ServerState {
    pub intake: Arc<Intake>,
    pub queue: JobQueue,
}

impl ServerState {
    pub fn new(intake: Arc<Intake>, queue: JobQueue) -> Self {
        Self { intake, queue }
    }
}
