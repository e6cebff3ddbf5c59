//! Additional unit tests for the backup and restore state machines

use che_operator::controller::state_machine::{
    BackupEvent, RestoreEvent, next_backup_state, next_restore_stage,
};
use che_operator::crd::{BackupState, RestoreStage};

mod backup_transitions {
    use super::*;

    #[test]
    fn test_trigger_from_every_settled_state() {
        for state in [
            BackupState::Pending,
            BackupState::Succeeded,
            BackupState::Failed,
        ] {
            assert_eq!(
                next_backup_state(state, BackupEvent::TriggerRequested),
                Some(BackupState::InProgress),
                "trigger from {:?} should start an attempt",
                state
            );
        }
    }

    #[test]
    fn test_exactly_one_attempt_per_trigger() {
        // The running attempt absorbs repeated trigger observations
        let state =
            next_backup_state(BackupState::InProgress, BackupEvent::TriggerRequested).unwrap();
        assert_eq!(state, BackupState::InProgress);
    }

    #[test]
    fn test_terminal_outcomes_only_from_in_progress() {
        for state in [
            BackupState::Pending,
            BackupState::Succeeded,
            BackupState::Failed,
        ] {
            assert!(next_backup_state(state, BackupEvent::AttemptSucceeded).is_none());
            assert!(next_backup_state(state, BackupEvent::AttemptFailed).is_none());
        }
    }
}

mod restore_transitions {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut stage = RestoreStage::Idle;
        for (event, expected) in [
            (RestoreEvent::TriggerRequested, RestoreStage::Downloading),
            (RestoreEvent::DownloadFinished, RestoreStage::Restoring),
            (RestoreEvent::RestoreFinished, RestoreStage::Completed),
        ] {
            stage = next_restore_stage(stage, event).unwrap();
            assert_eq!(stage, expected);
        }
    }

    #[test]
    fn test_reentry_resumes_current_stage() {
        assert_eq!(
            next_restore_stage(RestoreStage::Downloading, RestoreEvent::TriggerRequested),
            Some(RestoreStage::Downloading)
        );
        assert_eq!(
            next_restore_stage(RestoreStage::Restoring, RestoreEvent::TriggerRequested),
            Some(RestoreStage::Restoring)
        );
    }

    #[test]
    fn test_download_must_precede_restore() {
        assert!(next_restore_stage(RestoreStage::Idle, RestoreEvent::DownloadFinished).is_none());
        assert!(next_restore_stage(RestoreStage::Idle, RestoreEvent::RestoreFinished).is_none());
    }

    #[test]
    fn test_failure_is_terminal_until_retrigger() {
        let stage =
            next_restore_stage(RestoreStage::Downloading, RestoreEvent::AttemptFailed).unwrap();
        assert_eq!(stage, RestoreStage::Failed);
        assert!(next_restore_stage(stage, RestoreEvent::DownloadFinished).is_none());
        assert_eq!(
            next_restore_stage(stage, RestoreEvent::TriggerRequested),
            Some(RestoreStage::Downloading)
        );
    }
}

mod phase_computation {
    use che_operator::controller::compute_phase;
    use che_operator::crd::ChePhase;
    use proptest::prelude::*;

    proptest! {
        /// The phase machine never produces Failed from replica counts
        /// alone, and zero available replicas is always Inactive
        #[test]
        fn phase_total(available in 0i32..10, desired in 0i32..10, replicas in 0i32..20) {
            let phase = compute_phase(available, desired, replicas);
            prop_assert_ne!(phase.clone(), ChePhase::Failed);
            if available == 0 {
                prop_assert_eq!(phase, ChePhase::Inactive);
            }
        }

        /// A fully available deployment with no surge pods is Active
        #[test]
        fn phase_active(desired in 1i32..10) {
            let phase = compute_phase(desired, desired, desired);
            prop_assert_eq!(phase, ChePhase::Active);
        }
    }
}
