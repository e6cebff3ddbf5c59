use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::backup::{BackupServerType, BackupServersConfigs};

/// CheClusterRestore is the Schema for the checlusterrestores API
///
/// A CheClusterRestore requests that the Che installation in its namespace be
/// replaced with the contents of a stored snapshot.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "org.eclipse.che",
    version = "v1",
    kind = "CheClusterRestore",
    plural = "checlusterrestores",
    namespaced,
    status = "CheClusterRestoreStatus",
    printcolumn = r#"{"name":"Stage", "type":"string", "jsonPath":".status.stage"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheClusterRestoreSpec {
    /// Start a restore attempt now. Reset to false by the operator after the
    /// attempt completes.
    #[serde(default)]
    pub trigger_now: bool,

    /// Snapshot to restore. Empty means the latest snapshot in the repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,

    /// Copy the backup server configuration from the CheClusterBackup in the
    /// same namespace before the attempt. Fails when more than one exists.
    #[serde(default)]
    pub copy_backup_server_configuration: bool,

    /// Delete this CR after a successful restore
    #[serde(default)]
    pub delete_configuration_after_restore: bool,

    /// Backup server configurations, same shape as on CheClusterBackup
    #[serde(default)]
    pub servers: BackupServersConfigs,

    /// Selects which configured backup server variant to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<BackupServerType>,
}

/// Status of a CheClusterRestore
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheClusterRestoreStatus {
    /// Current stage of the restore attempt
    #[serde(default)]
    pub stage: RestoreStage,

    /// Progress or outcome message of the most recent attempt
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Restore attempt lifecycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum RestoreStage {
    /// No attempt is running
    #[default]
    #[serde(rename = "")]
    Idle,
    /// The snapshot is being downloaded from the repository
    Downloading,
    /// Downloaded data is being applied to the cluster
    Restoring,
    /// The most recent attempt finished successfully
    Completed,
    /// The most recent attempt failed terminally
    Failed,
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreStage::Idle => write!(f, "Idle"),
            RestoreStage::Downloading => write!(f, "Downloading"),
            RestoreStage::Restoring => write!(f, "Restoring"),
            RestoreStage::Completed => write!(f, "Completed"),
            RestoreStage::Failed => write!(f, "Failed"),
        }
    }
}
