use std::path::Path;

use async_trait::async_trait;
use kube::Client;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::backup::BackupError;
use crate::backup::restic::ResticClient;
use crate::backup::servers::{BackupServer, get_secret, resolve_repo_password, secret_key};
use crate::crd::SftpServerConfig;

/// Secret key holding the SSH private key
const SSH_PRIVATE_KEY: &str = "ssh-privatekey";

/// SFTP backup server.
///
/// Repository URL form: `sftp:user@host:port/path`. The private key and a
/// minimal ssh client config are written into a per-operation temporary
/// directory and handed to the snapshot tool through its sftp command
/// option; the operator's own home directory is never touched.
///
/// Host-key checking is disabled on purpose: the server identity is pinned
/// by the CR configuration, not by a known-hosts file.
#[derive(Debug)]
pub struct SftpBackupServer {
    config: SftpServerConfig,
    restic: Option<ResticClient>,
    // Keeps the key material alive for the lifetime of the client
    _workdir: Option<TempDir>,
}

impl SftpBackupServer {
    pub fn new(config: SftpServerConfig) -> Self {
        Self {
            config,
            restic: None,
            _workdir: None,
        }
    }
}

/// Assemble the repository URL from a validated config
fn repository_url(config: &SftpServerConfig) -> String {
    let host_port = if config.port.is_empty() {
        config.hostname.clone()
    } else {
        format!("{}:{}", config.hostname, config.port)
    };
    format!("sftp:{}@{}/{}", config.username, host_port, config.repo.trim_start_matches('/'))
}

/// Write the private key (0600) and ssh config into the working directory,
/// returning the ssh command for the snapshot tool
async fn stage_ssh_material(
    workdir: &Path,
    config: &SftpServerConfig,
    private_key: &str,
) -> Result<String, BackupError> {
    let key_path = workdir.join("id-backup");
    {
        let mut file = tokio::fs::File::create(&key_path).await?;
        file.write_all(private_key.as_bytes()).await?;
        if !private_key.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let config_path = workdir.join("ssh-config");
    let ssh_config = format!(
        "Host {}\n  StrictHostKeyChecking no\n  IdentityFile {}\n",
        config.hostname,
        key_path.display()
    );
    tokio::fs::write(&config_path, ssh_config).await?;

    let mut command = format!(
        "ssh -F {} -i {}",
        config_path.display(),
        key_path.display()
    );
    if !config.port.is_empty() {
        command.push_str(&format!(" -p {}", config.port));
    }
    command.push_str(&format!(" {}@{} -s sftp", config.username, config.hostname));
    Ok(command)
}

#[async_trait]
impl BackupServer for SftpBackupServer {
    async fn prepare_configuration(
        &mut self,
        client: &Client,
        namespace: &str,
    ) -> Result<(), BackupError> {
        if self.config.username.is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "sftp backup server username is not configured".to_string(),
            ));
        }
        if self.config.hostname.is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "sftp backup server hostname is not configured".to_string(),
            ));
        }
        if self.config.repo.is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "sftp backup server repository path is not configured".to_string(),
            ));
        }
        if self.config.ssh_key_secret_ref.is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "sftp backup server ssh key secret is not configured".to_string(),
            ));
        }

        let secret_name = &self.config.ssh_key_secret_ref;
        let secret = get_secret(client, namespace, secret_name).await?;
        let private_key = secret_key(&secret, secret_name, SSH_PRIVATE_KEY)?;

        let workdir = TempDir::with_prefix("che-backup-ssh-")?;
        let sftp_command = stage_ssh_material(workdir.path(), &self.config, &private_key).await?;

        let url = repository_url(&self.config);
        let password = resolve_repo_password(client, namespace, &self.config.repo_password).await?;

        self.restic = Some(
            ResticClient::new(url, password).with_option(format!("sftp.command={}", sftp_command)),
        );
        self._workdir = Some(workdir);
        Ok(())
    }

    fn restic(&self) -> Result<&ResticClient, BackupError> {
        self.restic.as_ref().ok_or_else(|| {
            BackupError::InvalidConfiguration("sftp backup server is not prepared".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SftpServerConfig {
        SftpServerConfig {
            username: "backup".to_string(),
            hostname: "sftp.example.com".to_string(),
            port: "2222".to_string(),
            repo: "/srv/che-backups".to_string(),
            ssh_key_secret_ref: "sftp-key".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_with_port() {
        assert_eq!(
            repository_url(&config()),
            "sftp:backup@sftp.example.com:2222/srv/che-backups"
        );
    }

    #[test]
    fn test_url_without_port() {
        let mut config = config();
        config.port.clear();
        config.repo = "backups/che".to_string();
        assert_eq!(
            repository_url(&config),
            "sftp:backup@sftp.example.com/backups/che"
        );
    }

    #[tokio::test]
    async fn test_stage_ssh_material() {
        let workdir = TempDir::new().unwrap();
        let command = stage_ssh_material(workdir.path(), &config(), "PRIVATE KEY DATA")
            .await
            .unwrap();

        assert!(command.contains("-p 2222"));
        assert!(command.contains("backup@sftp.example.com -s sftp"));

        let ssh_config = std::fs::read_to_string(workdir.path().join("ssh-config")).unwrap();
        assert!(ssh_config.contains("Host sftp.example.com"));
        assert!(ssh_config.contains("StrictHostKeyChecking no"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(workdir.path().join("id-backup"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
