use async_trait::async_trait;
use kube::Client;

use crate::backup::BackupError;
use crate::backup::restic::ResticClient;
use crate::backup::servers::{BackupServer, get_secret, resolve_repo_password, secret_key};
use crate::crd::AwsS3ServerConfig;

/// Default endpoint when the CR leaves the hostname empty
const DEFAULT_S3_HOSTNAME: &str = "s3.amazonaws.com";

/// Secret keys for S3 credentials
const ACCESS_KEY_ID_KEY: &str = "awsAccessKeyId";
const SECRET_ACCESS_KEY_KEY: &str = "awsSecretAccessKey";

/// S3-compatible backup server.
///
/// Repository URL form: `s3:[proto://]host[:port]/bucket/repo`. Credentials
/// go to the snapshot tool through the standard AWS environment variables.
#[derive(Debug)]
pub struct AwsS3BackupServer {
    config: AwsS3ServerConfig,
    restic: Option<ResticClient>,
}

impl AwsS3BackupServer {
    pub fn new(config: AwsS3ServerConfig) -> Self {
        Self {
            config,
            restic: None,
        }
    }
}

/// Assemble the repository URL from a validated config
fn repository_url(config: &AwsS3ServerConfig) -> String {
    let hostname = if config.hostname.is_empty() {
        DEFAULT_S3_HOSTNAME
    } else {
        config.hostname.as_str()
    };

    let mut url = String::from("s3:");
    if !config.protocol.is_empty() {
        url.push_str(&config.protocol);
        url.push_str("://");
    }
    url.push_str(hostname);
    if !config.port.is_empty() {
        url.push(':');
        url.push_str(&config.port);
    }
    url.push('/');
    url.push_str(config.repo.trim_matches('/'));
    url
}

#[async_trait]
impl BackupServer for AwsS3BackupServer {
    async fn prepare_configuration(
        &mut self,
        client: &Client,
        namespace: &str,
    ) -> Result<(), BackupError> {
        if self.config.repo.is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "s3 backup server repository is not configured".to_string(),
            ));
        }

        // Inline keys take precedence over the secret
        let (access_key_id, secret_access_key) = if !self.config.access_key_id.is_empty()
            && !self.config.secret_access_key.is_empty()
        {
            (
                self.config.access_key_id.clone(),
                self.config.secret_access_key.clone(),
            )
        } else if !self.config.aws_access_key_secret_ref.is_empty() {
            let secret_name = &self.config.aws_access_key_secret_ref;
            let secret = get_secret(client, namespace, secret_name).await?;
            (
                secret_key(&secret, secret_name, ACCESS_KEY_ID_KEY)?,
                secret_key(&secret, secret_name, SECRET_ACCESS_KEY_KEY)?,
            )
        } else {
            return Err(BackupError::InvalidConfiguration(
                "s3 backup server credentials are not configured".to_string(),
            ));
        };

        let url = repository_url(&self.config);
        let password = resolve_repo_password(client, namespace, &self.config.repo_password).await?;

        self.restic = Some(
            ResticClient::new(url, password)
                .with_env("AWS_ACCESS_KEY_ID", access_key_id)
                .with_env("AWS_SECRET_ACCESS_KEY", secret_access_key),
        );
        Ok(())
    }

    fn restic(&self) -> Result<&ResticClient, BackupError> {
        self.restic.as_ref().ok_or_else(|| {
            BackupError::InvalidConfiguration("s3 backup server is not prepared".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_default_host() {
        let config = AwsS3ServerConfig {
            repo: "che-bucket/backups".to_string(),
            ..Default::default()
        };
        assert_eq!(
            repository_url(&config),
            "s3:s3.amazonaws.com/che-bucket/backups"
        );
    }

    #[test]
    fn test_url_custom_endpoint() {
        let config = AwsS3ServerConfig {
            protocol: "http".to_string(),
            hostname: "minio.example.com".to_string(),
            port: "9000".to_string(),
            repo: "che/backups".to_string(),
            ..Default::default()
        };
        assert_eq!(
            repository_url(&config),
            "s3:http://minio.example.com:9000/che/backups"
        );
    }
}
