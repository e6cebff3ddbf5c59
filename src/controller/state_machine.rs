//! Explicit state machines for the backup and restore lifecycles.
//!
//! The reconcilers derive an event from the CR and the attempt outcome,
//! then ask the machine for the next state. Invalid transitions are
//! rejected, which keeps the lifecycles auditable and prevents a stray
//! status write from resurrecting a finished attempt.

use crate::crd::{BackupState, RestoreStage};

/// Events observed by the backup reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupEvent {
    /// `spec.triggerNow` turned true
    TriggerRequested,
    /// The attempt stored a snapshot
    AttemptSucceeded,
    /// The attempt failed terminally
    AttemptFailed,
}

/// Compute the next backup state; `None` means the event is not valid in
/// the current state
pub fn next_backup_state(state: BackupState, event: BackupEvent) -> Option<BackupState> {
    use BackupEvent::*;
    use BackupState::*;

    match (state, event) {
        // A reset trigger starts a fresh attempt from any settled state
        (Pending | Succeeded | Failed, TriggerRequested) => Some(InProgress),
        (InProgress, AttemptSucceeded) => Some(Succeeded),
        (InProgress, AttemptFailed) => Some(Failed),
        // Re-entry while an attempt runs is a no-op, not a new attempt
        (InProgress, TriggerRequested) => Some(InProgress),
        _ => None,
    }
}

/// Events observed by the restore reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreEvent {
    /// `spec.triggerNow` turned true
    TriggerRequested,
    /// The snapshot finished downloading
    DownloadFinished,
    /// The downloaded data was applied to the cluster
    RestoreFinished,
    /// The attempt failed terminally
    AttemptFailed,
}

/// Compute the next restore stage; `None` means the event is not valid in
/// the current stage
pub fn next_restore_stage(stage: RestoreStage, event: RestoreEvent) -> Option<RestoreStage> {
    use RestoreEvent::*;
    use RestoreStage::*;

    match (stage, event) {
        (Idle | Completed | Failed, TriggerRequested) => Some(Downloading),
        (Downloading, DownloadFinished) => Some(Restoring),
        (Restoring, RestoreFinished) => Some(Completed),
        (Downloading | Restoring, AttemptFailed) => Some(Failed),
        // Crash re-entry within a trigger cycle resumes the current stage
        (Downloading, TriggerRequested) => Some(Downloading),
        (Restoring, TriggerRequested) => Some(Restoring),
        _ => None,
    }
}
