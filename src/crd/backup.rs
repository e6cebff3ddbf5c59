use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CheClusterBackup is the Schema for the checlusterbackups API
///
/// A CheClusterBackup requests a snapshot of the Che installation in its
/// namespace. Setting `triggerNow` starts exactly one attempt; the operator
/// resets the flag and records the outcome in the status.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "org.eclipse.che",
    version = "v1",
    kind = "CheClusterBackup",
    plural = "checlusterbackups",
    namespaced,
    status = "CheClusterBackupStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Snapshot", "type":"string", "jsonPath":".status.snapshotId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheClusterBackupSpec {
    /// Provision a REST backup server inside the namespace and use it as the
    /// snapshot repository
    #[serde(default)]
    pub use_internal_backup_server: bool,

    /// Start a backup attempt now. Reset to false by the operator after the
    /// attempt completes, regardless of outcome.
    #[serde(default)]
    pub trigger_now: bool,

    /// Backup server configurations. When serverType is unset, exactly one
    /// variant must be configured.
    #[serde(default)]
    pub servers: BackupServersConfigs,

    /// Selects which configured backup server variant to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<BackupServerType>,
}

/// Status of a CheClusterBackup
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheClusterBackupStatus {
    /// Current state of the backup attempt
    #[serde(default)]
    pub state: BackupState,

    /// Identifier of the stored snapshot, set on success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,

    /// Outcome message of the most recent attempt
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Backup attempt lifecycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupState {
    /// No attempt is running
    #[default]
    Pending,
    /// An attempt is running
    InProgress,
    /// The most recent attempt stored a snapshot
    Succeeded,
    /// The most recent attempt failed terminally
    Failed,
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupState::Pending => write!(f, "Pending"),
            BackupState::InProgress => write!(f, "InProgress"),
            BackupState::Succeeded => write!(f, "Succeeded"),
            BackupState::Failed => write!(f, "Failed"),
        }
    }
}

/// Discriminant for the configured backup server variants
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupServerType {
    /// REST server, internal or external
    Rest,
    /// SFTP server
    Sftp,
    /// S3-compatible object storage
    AwsS3,
}

impl std::fmt::Display for BackupServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupServerType::Rest => write!(f, "rest"),
            BackupServerType::Sftp => write!(f, "sftp"),
            BackupServerType::AwsS3 => write!(f, "awss3"),
        }
    }
}

/// The per-variant backup server configurations. At most one is used per
/// operation; `configured` lists the variants that carry any settings.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupServersConfigs {
    /// REST server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestServerConfig>,

    /// SFTP server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sftp: Option<SftpServerConfig>,

    /// S3-compatible server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awss3: Option<AwsS3ServerConfig>,
}

impl BackupServersConfigs {
    /// Variants that carry a configuration, in declaration order
    pub fn configured(&self) -> Vec<BackupServerType> {
        let mut types = Vec::new();
        if self.rest.is_some() {
            types.push(BackupServerType::Rest);
        }
        if self.sftp.is_some() {
            types.push(BackupServerType::Sftp);
        }
        if self.awss3.is_some() {
            types.push(BackupServerType::AwsS3);
        }
        types
    }
}

/// Repository password, either inline or read from a secret
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepoPassword {
    /// Repository password in clear text. Takes precedence over the secret.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_password: String,

    /// Secret holding the repository password under a `repo-password` key,
    /// or as the sole key of a single-key secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_password_secret_ref: String,
}

/// REST backup server settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestServerConfig {
    /// Protocol, `http` or `https`. Defaults to https.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    /// Server hostname. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Server port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,

    /// Repository path on the server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    /// Secret holding `username` and `password` keys for HTTP basic auth
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credentials_secret_ref: String,

    /// Repository password
    #[serde(flatten)]
    pub repo_password: RepoPassword,
}

/// SFTP backup server settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SftpServerConfig {
    /// SSH user name. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Server hostname. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Server port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,

    /// Absolute or relative repository path on the server. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    /// Secret holding an `ssh-privatekey` key with the private key. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key_secret_ref: String,

    /// Repository password
    #[serde(flatten)]
    pub repo_password: RepoPassword,
}

/// S3-compatible backup server settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AwsS3ServerConfig {
    /// Protocol, `http` or `https`. Defaults to https.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    /// Server hostname. Defaults to s3.amazonaws.com.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Server port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,

    /// Bucket and repository path, e.g. `bucket/repo`. Required.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,

    /// Access key id in clear text. Takes precedence over the secret.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,

    /// Secret access key in clear text. Takes precedence over the secret.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_access_key: String,

    /// Secret holding `awsAccessKeyId` and `awsSecretAccessKey` keys
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_access_key_secret_ref: String,

    /// Repository password
    #[serde(flatten)]
    pub repo_password: RepoPassword,
}
