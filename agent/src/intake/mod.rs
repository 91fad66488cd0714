//! Event intake: signature verification, decoding and routing.
//!
//! Intake runs on the request path. It never touches the filesystem or the
//! attached boards; an eligible event leaves as a [`Job`] for the deployer
//! worker, anything else concludes here as a finished [`RunResult`].

pub mod event;
pub mod router;
pub mod signature;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::debug;

use crate::deploy::fsm::{PipelineEvent, PipelineFsm};
use crate::deploy::report::RunResult;
use crate::errors::{DeployError, IntakeError};
use crate::intake::event::{Delivery, DeploymentEvent};
use crate::utils::generate_uuid;

/// Authenticates and decodes inbound notifications
pub struct EventVerifier {
    secret: SecretString,
}

impl EventVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Check the signature over the raw body, then decode it per its kind
    pub fn verify(&self, delivery: &Delivery) -> Result<DeploymentEvent, IntakeError> {
        signature::verify_signature(&self.secret, &delivery.body, delivery.signature.as_deref())?;
        event::decode(delivery)
    }
}

/// An accepted deployment waiting for the worker
#[derive(Debug)]
pub struct Job {
    pub run_id: String,
    pub event: DeploymentEvent,
    pub fsm: PipelineFsm,
    pub accepted_at: DateTime<Utc>,
}

/// Verifier and router composed
pub struct Intake {
    verifier: EventVerifier,
    repository_override: Option<String>,
}

impl Intake {
    /// `repository_override`, when set, replaces the payload's clone URL
    pub fn new(verifier: EventVerifier, repository_override: Option<String>) -> Self {
        Self {
            verifier,
            repository_override,
        }
    }

    /// Turn a delivery into a job, or into a concluded result when it is
    /// rejected or not eligible.
    pub fn admit(&self, delivery: &Delivery) -> Result<Job, RunResult> {
        let run_id = generate_uuid();
        let accepted_at = Utc::now();
        let mut fsm = PipelineFsm::new();
        fsm.apply(PipelineEvent::Receive);

        let event = match self.verifier.verify(delivery) {
            Ok(event) => event,
            Err(e) => {
                debug!(run_id = %run_id, delivery = ?delivery.delivery_id, "Delivery rejected: {}", e);
                fsm.apply(PipelineEvent::StageFailed(DeployError::from(e)));
                return Err(RunResult::concluded(run_id, None, accepted_at, &fsm));
            }
        };
        fsm.apply(PipelineEvent::Verified);

        if let Err(e) = router::route(&event) {
            fsm.apply(PipelineEvent::StageFailed(e));
            return Err(RunResult::concluded(
                run_id,
                Some(event.reference().to_string()),
                accepted_at,
                &fsm,
            ));
        }

        let event = match &self.repository_override {
            Some(url) => event.with_repository_url(url.clone()),
            None => event,
        };

        Ok(Job {
            run_id,
            event,
            fsm,
            accepted_at,
        })
    }
}
