//! Deployment eligibility

use crate::errors::DeployError;
use crate::intake::event::{DeploymentEvent, RefKind};

/// Decide whether `event` should deploy. Only tag creation does.
pub fn route(event: &DeploymentEvent) -> Result<(), DeployError> {
    match event.ref_kind() {
        RefKind::Tag => Ok(()),
        other => Err(DeployError::NotEligible {
            ref_kind: other.to_string(),
            reference: event.reference().to_string(),
        }),
    }
}
