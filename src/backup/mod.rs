//! Backup and restore engine.
//!
//! Snapshots are collected into a local staging directory, packaged by the
//! external snapshot tool and shipped to a pluggable backup server. The
//! reverse path downloads a snapshot and replays it into the cluster.

pub mod collect;
pub mod internal_server;
pub mod pod_exec;
pub mod restic;
pub mod restore;
pub mod servers;

pub use restic::{ResticClient, SnapshotStat};
pub use servers::{BackupServer, resolve_backup_server};

use thiserror::Error;

/// Staging directory for backup collection
pub const BACKUP_STAGING_DIR: &str = "/tmp/che-backup-data";

/// Staging directory for downloaded snapshots during restore
pub const RESTORE_STAGING_DIR: &str = "/tmp/che-restore-data";

/// Errors raised by the backup/restore engine
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup server configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Secret {name} is missing required key {key}")]
    SecretMissingKey { name: String, key: String },

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Snapshot tool failed: {0}")]
    ResticFailed(String),

    #[error("Snapshot tool timed out after {0:?}")]
    ResticTimeout(std::time::Duration),

    #[error("Repository not reachable: {0}")]
    RepositoryUnreachable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Database pod not found in namespace {0}")]
    DatabasePodNotFound(String),

    #[error("In-pod command failed: {0}")]
    PodExecFailed(String),

    #[error("Backup server is not ready yet")]
    ServerNotReady,

    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),

    #[error("{0}")]
    Failed(String),
}

impl BackupError {
    /// Whether a new attempt may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            BackupError::KubeError(_)
            | BackupError::ResticTimeout(_)
            | BackupError::RepositoryUnreachable(_)
            | BackupError::DatabasePodNotFound(_)
            | BackupError::ServerNotReady
            | BackupError::WaitTimeout(_)
            | BackupError::IoError(_) => true,
            BackupError::InvalidConfiguration(_)
            | BackupError::SecretMissingKey { .. }
            | BackupError::SecretNotFound(_)
            | BackupError::ResticFailed(_)
            | BackupError::PodExecFailed(_)
            | BackupError::YamlError(_)
            | BackupError::Failed(_) => false,
        }
    }
}
