//! Internal REST backup server provisioning.
//!
//! When a CheClusterBackup asks for an internal server, the operator runs a
//! REST repository server inside the namespace: a Deployment, a Service and
//! an auto-generated repo-password Secret. The CR's REST configuration is
//! then rewritten to point at the service, so the rest of the pipeline is
//! identical to the external REST case.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

use crate::backup::servers::REPO_PASSWORD_SECRET_KEY;
use crate::backup::BackupError;
use crate::crd::{CheClusterBackup, RepoPassword, RestServerConfig};
use crate::deploy::{component_labels, component_selector};
use crate::platform::ImageDefaults;
use crate::sync::sync_object;

/// Objects provisioned for the internal server
pub const BACKUP_SERVER_DEPLOYMENT_NAME: &str = "backup-rest-server-deployment";
pub const BACKUP_SERVER_SERVICE_NAME: &str = "backup-rest-server-service";
pub const BACKUP_SERVER_SECRET_NAME: &str = "backup-rest-server-repo-password";

/// Port the REST server listens on
pub const BACKUP_SERVER_PORT: i32 = 8000;

/// Repository path on the internal server
pub const INTERNAL_REPO: &str = "che";

const COMPONENT: &str = "backup-rest-server";

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Owner reference pointing at the backup CR, so the server is
/// garbage-collected with it
fn owner_reference(backup: &CheClusterBackup) -> OwnerReference {
    OwnerReference {
        api_version: "org.eclipse.che/v1".to_string(),
        kind: "CheClusterBackup".to_string(),
        name: backup.name_any(),
        uid: backup.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Ensure the internal server's Deployment, Service and repo-password
/// Secret exist. Returns `true` when all three are in sync.
pub async fn ensure_internal_backup_server(
    client: &Client,
    namespace: &str,
    backup: &CheClusterBackup,
    images: &ImageDefaults,
) -> Result<bool, BackupError> {
    let mut in_sync = true;

    // The password secret is generated once and then left alone
    let secrets: kube::Api<Secret> = kube::Api::namespaced(client.clone(), namespace);
    if secrets.get_opt(BACKUP_SERVER_SECRET_NAME).await?.is_none() {
        let secret = generate_repo_password_secret(backup, namespace);
        in_sync &= sync_object(client, namespace, secret)
            .await
            .map_err(to_backup_error)?;
    }

    let deployment = generate_deployment(backup, namespace, images);
    in_sync &= sync_object(client, namespace, deployment)
        .await
        .map_err(to_backup_error)?;

    let service = generate_service(backup, namespace);
    in_sync &= sync_object(client, namespace, service)
        .await
        .map_err(to_backup_error)?;

    Ok(in_sync)
}

fn to_backup_error(e: crate::controller::error::Error) -> BackupError {
    match e {
        crate::controller::error::Error::KubeError(e) => BackupError::KubeError(e),
        other => BackupError::Failed(other.to_string()),
    }
}

/// Probe the internal server. Connection refused means the pod is not up
/// yet; any HTTP response, including 404 for the empty repository, means
/// the server is serving.
pub async fn is_internal_server_ready(namespace: &str) -> Result<bool, BackupError> {
    let url = format!(
        "http://{}.{}.svc:{}/",
        BACKUP_SERVER_SERVICE_NAME, namespace, BACKUP_SERVER_PORT
    );

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| BackupError::Failed(format!("http client: {}", e)))?;

    match client.head(&url).send().await {
        Ok(response) => {
            debug!(url = %url, status = %response.status(), "Internal backup server responded");
            Ok(true)
        }
        Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
        Err(e) => Err(BackupError::RepositoryUnreachable(format!(
            "internal backup server probe failed: {}",
            e
        ))),
    }
}

/// The REST configuration pointing at the internal server
pub fn internal_rest_config(namespace: &str) -> RestServerConfig {
    RestServerConfig {
        protocol: "http".to_string(),
        hostname: format!("{}.{}.svc", BACKUP_SERVER_SERVICE_NAME, namespace),
        port: BACKUP_SERVER_PORT.to_string(),
        repo: INTERNAL_REPO.to_string(),
        credentials_secret_ref: String::new(),
        repo_password: RepoPassword {
            repo_password: String::new(),
            repo_password_secret_ref: BACKUP_SERVER_SECRET_NAME.to_string(),
        },
    }
}

fn generate_repo_password_secret(backup: &CheClusterBackup, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(BACKUP_SERVER_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(backup)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            REPO_PASSWORD_SECRET_KEY.to_string(),
            generate_password(32),
        )])),
        ..Default::default()
    }
}

fn generate_deployment(
    backup: &CheClusterBackup,
    namespace: &str,
    images: &ImageDefaults,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(BACKUP_SERVER_DEPLOYMENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(backup)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(component_selector(COMPONENT)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(component_labels(COMPONENT)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "rest-server".to_string(),
                        image: Some(images.backup_rest_server.clone()),
                        args: Some(vec![
                            "--no-auth".to_string(),
                            "--listen".to_string(),
                            format!(":{}", BACKUP_SERVER_PORT),
                        ]),
                        ports: Some(vec![ContainerPort {
                            container_port: BACKUP_SERVER_PORT,
                            name: Some("rest".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_service(backup: &CheClusterBackup, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(BACKUP_SERVER_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(backup)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(component_selector(COMPONENT)),
            ports: Some(vec![ServicePort {
                port: BACKUP_SERVER_PORT,
                target_port: Some(IntOrString::Int(BACKUP_SERVER_PORT)),
                name: Some("rest".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup_cr() -> CheClusterBackup {
        CheClusterBackup {
            metadata: ObjectMeta {
                name: Some("backup".to_string()),
                namespace: Some("eclipse-che".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn test_internal_rest_config() {
        let config = internal_rest_config("eclipse-che");
        assert_eq!(config.protocol, "http");
        assert_eq!(
            config.hostname,
            "backup-rest-server-service.eclipse-che.svc"
        );
        assert_eq!(config.port, "8000");
        assert_eq!(config.repo, "che");
        assert_eq!(
            config.repo_password.repo_password_secret_ref,
            BACKUP_SERVER_SECRET_NAME
        );
    }

    #[test]
    fn test_deployment_owned_by_backup_cr() {
        let images = ImageDefaults::from_env();
        let deployment = generate_deployment(&backup_cr(), "eclipse-che", &images);
        let owners = deployment.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "CheClusterBackup");
        assert_eq!(owners[0].name, "backup");
    }

    #[test]
    fn test_generated_password_charset() {
        let password = generate_password(32);
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_service_targets_server_port() {
        let service = generate_service(&backup_cr(), "eclipse-che");
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, BACKUP_SERVER_PORT);
    }
}
