use async_trait::async_trait;
use kube::Client;

use crate::backup::BackupError;
use crate::backup::restic::ResticClient;
use crate::backup::servers::{BackupServer, get_secret, resolve_repo_password, secret_key};
use crate::crd::RestServerConfig;

/// REST backup server, internal or external.
///
/// Repository URL form: `rest:<proto>://[user:pw@]host[:port]/<repo>/`
#[derive(Debug)]
pub struct RestBackupServer {
    config: RestServerConfig,
    restic: Option<ResticClient>,
}

impl RestBackupServer {
    pub fn new(config: RestServerConfig) -> Self {
        Self {
            config,
            restic: None,
        }
    }
}

/// Assemble the repository URL from a validated config and optional
/// `user:password@` credentials
fn repository_url(config: &RestServerConfig, credentials: &str) -> String {
    let protocol = if config.protocol.is_empty() {
        "https"
    } else {
        config.protocol.as_str()
    };

    let host_port = if config.port.is_empty() {
        config.hostname.clone()
    } else {
        format!("{}:{}", config.hostname, config.port)
    };

    let repo = config.repo.trim_matches('/');
    if repo.is_empty() {
        format!("rest:{}://{}{}/", protocol, credentials, host_port)
    } else {
        format!("rest:{}://{}{}/{}/", protocol, credentials, host_port, repo)
    }
}

#[async_trait]
impl BackupServer for RestBackupServer {
    async fn prepare_configuration(
        &mut self,
        client: &Client,
        namespace: &str,
    ) -> Result<(), BackupError> {
        if self.config.hostname.is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "rest backup server hostname is not configured".to_string(),
            ));
        }

        let credentials = if self.config.credentials_secret_ref.is_empty() {
            String::new()
        } else {
            let secret_name = &self.config.credentials_secret_ref;
            let secret = get_secret(client, namespace, secret_name).await?;
            let username = secret_key(&secret, secret_name, "username")?;
            let password = secret_key(&secret, secret_name, "password")?;
            format!("{}:{}@", username, password)
        };

        let url = repository_url(&self.config, &credentials);
        let password = resolve_repo_password(client, namespace, &self.config.repo_password).await?;
        self.restic = Some(ResticClient::new(url, password));
        Ok(())
    }

    fn restic(&self) -> Result<&ResticClient, BackupError> {
        self.restic.as_ref().ok_or_else(|| {
            BackupError::InvalidConfiguration("rest backup server is not prepared".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_defaults_to_https() {
        let config = RestServerConfig {
            hostname: "backup.example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(
            repository_url(&config, ""),
            "rest:https://backup.example.com/"
        );
    }

    #[test]
    fn test_url_with_port_repo_and_credentials() {
        let config = RestServerConfig {
            protocol: "http".to_string(),
            hostname: "backup.example.com".to_string(),
            port: "8000".to_string(),
            repo: "che".to_string(),
            ..Default::default()
        };
        assert_eq!(
            repository_url(&config, "user:pw@"),
            "rest:http://user:pw@backup.example.com:8000/che/"
        );
    }

    #[test]
    fn test_url_strips_repo_slashes() {
        let config = RestServerConfig {
            hostname: "backup.example.com".to_string(),
            repo: "/che/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            repository_url(&config, ""),
            "rest:https://backup.example.com/che/"
        );
    }

    #[test]
    fn test_unprepared_client_rejected() {
        let server = RestBackupServer::new(RestServerConfig::default());
        assert!(server.restic().is_err());
    }
}
