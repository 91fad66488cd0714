//! FSM unit tests

use tagflash::deploy::fsm::{PipelineEvent, PipelineFsm, PipelineState, Stage};
use tagflash::errors::{DeployError, FetchError, FlashError, FlashFailure, IntakeError};

fn fsm_at_fetching() -> PipelineFsm {
    let mut fsm = PipelineFsm::new();
    fsm.process(PipelineEvent::Receive).unwrap();
    fsm.process(PipelineEvent::Verified).unwrap();
    fsm.process(PipelineEvent::Dispatch).unwrap();
    fsm
}

#[test]
fn test_fsm_initial_state() {
    let fsm = PipelineFsm::new();
    assert_eq!(fsm.state(), PipelineState::Idle);
    assert!(fsm.error().is_none());
    assert!(fsm.stage_reached().is_none());
}

#[test]
fn test_fsm_invalid_signature_concludes_at_verifying() {
    let mut fsm = PipelineFsm::new();
    fsm.process(PipelineEvent::Receive).unwrap();
    fsm.process(PipelineEvent::StageFailed(DeployError::from(
        IntakeError::InvalidSignature("digest mismatch".to_string()),
    )))
    .unwrap();

    assert_eq!(fsm.state(), PipelineState::Failed(Stage::Verifying));
    assert!(fsm.process(PipelineEvent::CleanedUp).is_err());
}

#[test]
fn test_fsm_fetch_failure_goes_through_cleanup() {
    let mut fsm = fsm_at_fetching();
    fsm.process(PipelineEvent::StageFailed(DeployError::from(FetchError::Clone {
        url: "https://example.com/fw.git".to_string(),
        reason: "exit 128".to_string(),
    })))
    .unwrap();
    assert_eq!(fsm.state(), PipelineState::CleaningUp);

    // Nothing but the cleanup result is accepted now
    assert!(fsm.process(PipelineEvent::Located).is_err());
    assert_eq!(fsm.state(), PipelineState::CleaningUp);

    fsm.process(PipelineEvent::CleanedUp).unwrap();
    assert_eq!(fsm.state(), PipelineState::Failed(Stage::Fetching));
}

#[test]
fn test_fsm_flash_failure_attribution() {
    let mut fsm = fsm_at_fetching();
    fsm.process(PipelineEvent::Fetched).unwrap();
    fsm.process(PipelineEvent::Located).unwrap();

    let err = DeployError::from(FlashError {
        device: "port-A".to_string(),
        cause: FlashFailure::Exit { code: Some(1) },
    });
    fsm.process(PipelineEvent::StageFailed(err.clone())).unwrap();
    fsm.process(PipelineEvent::CleanedUp).unwrap();

    assert_eq!(fsm.state(), PipelineState::Failed(Stage::Flashing));
    assert_eq!(fsm.error(), Some(&err));
    assert_eq!(err.stage(), Stage::Flashing);
}

#[test]
fn test_fsm_reset_returns_to_idle() {
    let mut fsm = fsm_at_fetching();
    fsm.process(PipelineEvent::Fetched).unwrap();
    fsm.process(PipelineEvent::Located).unwrap();
    fsm.process(PipelineEvent::Flashed).unwrap();
    fsm.process(PipelineEvent::CleanedUp).unwrap();
    assert_eq!(fsm.state(), PipelineState::Succeeded);

    fsm.process(PipelineEvent::Reset).unwrap();
    assert_eq!(fsm.state(), PipelineState::Idle);
    assert!(fsm.stage_reached().is_none());

    // A machine that has not concluded cannot be reset
    let mut running = fsm_at_fetching();
    assert!(running.process(PipelineEvent::Reset).is_err());
}

#[test]
fn test_fsm_apply_ignores_invalid_transition() {
    let mut fsm = PipelineFsm::new();
    fsm.apply(PipelineEvent::Flashed);
    assert_eq!(fsm.state(), PipelineState::Idle);
}
