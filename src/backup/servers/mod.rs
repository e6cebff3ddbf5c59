//! Pluggable backup server abstraction.
//!
//! A backup server knows how to turn its CR configuration into a working
//! snapshot repository: validate the settings, resolve credentials from
//! secrets, assemble the repository URL and hand transport to the snapshot
//! client. The internal variant is the REST variant pointed at the
//! operator-provisioned in-cluster service (see `backup::internal_server`).

mod rest;
mod s3;
mod sftp;

pub use rest::RestBackupServer;
pub use s3::AwsS3BackupServer;
pub use sftp::SftpBackupServer;

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::backup::restic::{ResticClient, SnapshotStat};
use crate::backup::BackupError;
use crate::crd::{BackupServerType, BackupServersConfigs, RepoPassword};

/// Key under which backup secrets hold the repository password
pub const REPO_PASSWORD_SECRET_KEY: &str = "repo-password";

/// A configured backup server.
///
/// `prepare_configuration` must be called before any repository operation;
/// the remaining methods delegate to the snapshot client it builds.
#[async_trait]
pub trait BackupServer: Send + Sync + std::fmt::Debug {
    /// Validate the configuration, resolve secrets and assemble the
    /// repository URL and credential environment
    async fn prepare_configuration(
        &mut self,
        client: &Client,
        namespace: &str,
    ) -> Result<(), BackupError>;

    /// The snapshot client built by `prepare_configuration`
    fn restic(&self) -> Result<&ResticClient, BackupError>;

    async fn init_repository(&self) -> Result<(), BackupError> {
        self.restic()?.init_repository().await
    }

    async fn is_repository_exist(&self) -> Result<bool, BackupError> {
        self.restic()?.is_repository_exist().await
    }

    async fn check_repository(&self) -> Result<(), BackupError> {
        self.restic()?.check_repository().await
    }

    async fn send_snapshot(&self, path: &Path) -> Result<SnapshotStat, BackupError> {
        self.restic()?.send_snapshot(path).await
    }

    async fn download_snapshot(&self, id: &str, path: &Path) -> Result<(), BackupError> {
        self.restic()?.download_snapshot(id, path).await
    }

    async fn download_last_snapshot(&self, path: &Path) -> Result<(), BackupError> {
        self.restic()?.download_last_snapshot(path).await
    }
}

/// Select and construct the backup server for a CR's configuration.
///
/// When `server_type` is set only that variant is considered; otherwise
/// exactly one variant must be configured.
pub fn resolve_backup_server(
    servers: &BackupServersConfigs,
    server_type: Option<BackupServerType>,
) -> Result<Box<dyn BackupServer>, BackupError> {
    let selected = match server_type {
        Some(selected) => selected,
        None => {
            let configured = servers.configured();
            match configured.len() {
                0 => {
                    return Err(BackupError::InvalidConfiguration(
                        "at least one backup server should be configured".to_string(),
                    ));
                }
                1 => configured[0],
                n => {
                    return Err(BackupError::InvalidConfiguration(format!(
                        "{} backup servers configured, please select which one to use",
                        n
                    )));
                }
            }
        }
    };

    match selected {
        BackupServerType::Rest => servers
            .rest
            .clone()
            .map(|config| Box::new(RestBackupServer::new(config)) as Box<dyn BackupServer>)
            .ok_or_else(|| {
                BackupError::InvalidConfiguration(
                    "rest backup server is selected but not configured".to_string(),
                )
            }),
        BackupServerType::Sftp => servers
            .sftp
            .clone()
            .map(|config| Box::new(SftpBackupServer::new(config)) as Box<dyn BackupServer>)
            .ok_or_else(|| {
                BackupError::InvalidConfiguration(
                    "sftp backup server is selected but not configured".to_string(),
                )
            }),
        BackupServerType::AwsS3 => servers
            .awss3
            .clone()
            .map(|config| Box::new(AwsS3BackupServer::new(config)) as Box<dyn BackupServer>)
            .ok_or_else(|| {
                BackupError::InvalidConfiguration(
                    "awss3 backup server is selected but not configured".to_string(),
                )
            }),
    }
}

/// Resolve the repository password.
///
/// Precedence: inline password, then the named secret's `repo-password` key,
/// then the sole key of a single-key secret.
pub(crate) async fn resolve_repo_password(
    client: &Client,
    namespace: &str,
    repo_password: &RepoPassword,
) -> Result<String, BackupError> {
    if !repo_password.repo_password.is_empty() {
        return Ok(repo_password.repo_password.clone());
    }

    if repo_password.repo_password_secret_ref.is_empty() {
        return Err(BackupError::InvalidConfiguration(
            "repository password is not configured".to_string(),
        ));
    }

    let secret_name = &repo_password.repo_password_secret_ref;
    let secret = get_secret(client, namespace, secret_name).await?;
    let data = secret.data.unwrap_or_default();

    if let Some(value) = data.get(REPO_PASSWORD_SECRET_KEY) {
        return bytes_to_string(&value.0, secret_name, REPO_PASSWORD_SECRET_KEY);
    }

    if data.len() == 1
        && let Some((key, value)) = data.iter().next()
    {
        return bytes_to_string(&value.0, secret_name, key);
    }

    Err(BackupError::SecretMissingKey {
        name: secret_name.clone(),
        key: REPO_PASSWORD_SECRET_KEY.to_string(),
    })
}

/// Fetch a secret, mapping 404 to a configuration error naming the secret
pub(crate) async fn get_secret(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Secret, BackupError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.get(name).await.map_err(|e| match &e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            BackupError::SecretNotFound(name.to_string())
        }
        _ => BackupError::KubeError(e),
    })
}

/// Read one key from a secret's data
pub(crate) fn secret_key(
    secret: &Secret,
    secret_name: &str,
    key: &str,
) -> Result<String, BackupError> {
    let data = secret.data.as_ref().ok_or_else(|| BackupError::SecretMissingKey {
        name: secret_name.to_string(),
        key: key.to_string(),
    })?;
    let value = data.get(key).ok_or_else(|| BackupError::SecretMissingKey {
        name: secret_name.to_string(),
        key: key.to_string(),
    })?;
    bytes_to_string(&value.0, secret_name, key)
}

fn bytes_to_string(bytes: &[u8], secret_name: &str, key: &str) -> Result<String, BackupError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| BackupError::SecretMissingKey {
        name: secret_name.to_string(),
        key: format!("{} (invalid UTF-8)", key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AwsS3ServerConfig, RestServerConfig, SftpServerConfig};

    #[test]
    fn test_factory_no_server_configured() {
        let servers = BackupServersConfigs::default();
        let err = resolve_backup_server(&servers, None).unwrap_err();
        assert!(
            err.to_string()
                .contains("at least one backup server should be configured")
        );
    }

    #[test]
    fn test_factory_single_server() {
        let servers = BackupServersConfigs {
            rest: Some(RestServerConfig {
                hostname: "backup.example.com".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(resolve_backup_server(&servers, None).is_ok());
    }

    #[test]
    fn test_factory_multiple_servers_need_selection() {
        let servers = BackupServersConfigs {
            rest: Some(RestServerConfig::default()),
            sftp: Some(SftpServerConfig::default()),
            awss3: Some(AwsS3ServerConfig::default()),
        };
        let err = resolve_backup_server(&servers, None).unwrap_err();
        assert!(
            err.to_string()
                .contains("3 backup servers configured, please select which one to use")
        );

        // Explicit selection resolves the ambiguity
        assert!(resolve_backup_server(&servers, Some(BackupServerType::Sftp)).is_ok());
    }

    #[test]
    fn test_factory_selected_but_missing() {
        let servers = BackupServersConfigs::default();
        let err = resolve_backup_server(&servers, Some(BackupServerType::AwsS3)).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
