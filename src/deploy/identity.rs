//! Managed identity provider (Keycloak) deployment.
//!
//! Skipped when the CR points at an external identity provider; the server
//! then uses `identityProviderURL` directly.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::core::ObjectMeta;
use std::time::Duration;

use crate::controller::error::Result;
use crate::crd::CheCluster;
use crate::deploy::database::pod_security_context;
use crate::deploy::{
    DeployContext, IDENTITY_PROVIDER_DEPLOYMENT_NAME, IDENTITY_PROVIDER_SERVICE_NAME,
    POSTGRES_SERVICE_NAME, ReconcileFlow, Reconcilable, component_labels, component_selector,
    owner_reference,
};
use crate::platform::ImageDefaults;
use crate::sync::sync_object;

const COMPONENT: &str = "keycloak";
const KEYCLOAK_PORT: i32 = 8080;

pub struct IdentityProviderReconciler;

#[async_trait]
impl Reconcilable for IdentityProviderReconciler {
    fn name(&self) -> &'static str {
        "identity-provider"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        if ctx.che_cluster.spec.auth.external_identity_provider {
            let url = ctx.che_cluster.spec.auth.identity_provider_url.clone();
            let status = ctx.che_cluster.status.get_or_insert_default();
            status.keycloak_url = url;
            status.keycloak_provisioned = true;
            return Ok(ReconcileFlow::Done);
        }

        let deployment = generate_deployment(&ctx.che_cluster, &ctx.namespace, &ctx.images);
        let mut in_sync = sync_object(&ctx.client, &ctx.namespace, deployment).await?;

        let service = generate_service(&ctx.che_cluster, &ctx.namespace);
        in_sync &= sync_object(&ctx.client, &ctx.namespace, service).await?;

        if !in_sync {
            return Ok(ReconcileFlow::Requeue(Duration::from_secs(1)));
        }

        let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let ready = deployments
            .get_opt(IDENTITY_PROVIDER_DEPLOYMENT_NAME)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.available_replicas)
            .unwrap_or(0)
            >= 1;

        if !ready {
            return Ok(ReconcileFlow::Requeue(Duration::from_secs(5)));
        }

        let keycloak_url = if ctx.che_host.is_empty() {
            String::new()
        } else {
            format!("{}://{}/auth", ctx.scheme(), ctx.che_host)
        };
        let status = ctx.che_cluster.status.get_or_insert_default();
        status.keycloak_provisioned = true;
        if !keycloak_url.is_empty() {
            status.keycloak_url = keycloak_url;
        }

        Ok(ReconcileFlow::Done)
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// HTTP probe against the Keycloak auth endpoint
fn keycloak_probe(initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/auth/".to_string()),
            port: IntOrString::Int(KEYCLOAK_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(12),
        ..Default::default()
    }
}

fn generate_deployment(
    cluster: &CheCluster,
    namespace: &str,
    images: &ImageDefaults,
) -> Deployment {
    let auth = &cluster.spec.auth;
    let database = &cluster.spec.database;

    let env = vec![
        secret_env("KEYCLOAK_USER", &auth.identity_provider_secret, "user"),
        secret_env(
            "KEYCLOAK_PASSWORD",
            &auth.identity_provider_secret,
            "password",
        ),
        EnvVar {
            name: "DB_VENDOR".to_string(),
            value: Some("postgres".to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "DB_ADDR".to_string(),
            value: Some(if database.external_db {
                database.che_postgres_hostname.clone()
            } else {
                POSTGRES_SERVICE_NAME.to_string()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "DB_DATABASE".to_string(),
            value: Some("keycloak".to_string()),
            ..Default::default()
        },
        secret_env("DB_USER", &database.che_postgres_secret, "user"),
        secret_env("DB_PASSWORD", &database.che_postgres_secret, "password"),
        EnvVar {
            name: "PROXY_ADDRESS_FORWARDING".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        },
    ];

    // Debug installs skip probes so a paused JVM is not restarted
    let (readiness, liveness) = if cluster.spec.server.che_debug {
        (None, None)
    } else {
        (Some(keycloak_probe(60)), Some(keycloak_probe(120)))
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(IDENTITY_PROVIDER_DEPLOYMENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(cluster)]),
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
                    security_context: pod_security_context(cluster),
                    containers: vec![Container {
                        name: COMPONENT.to_string(),
                        image: Some(images.identity_provider_image(cluster)),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            container_port: KEYCLOAK_PORT,
                            name: Some("http".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: readiness,
                        liveness_probe: liveness,
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

fn generate_service(cluster: &CheCluster, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(IDENTITY_PROVIDER_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(component_selector(COMPONENT)),
            ports: Some(vec![ServicePort {
                port: KEYCLOAK_PORT,
                target_port: Some(IntOrString::Int(KEYCLOAK_PORT)),
                name: Some("http".to_string()),
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
    use crate::crd::CheClusterSpec;
    use crate::deploy::defaults::apply_defaults;

    fn defaulted_cluster() -> CheCluster {
        let mut cluster = CheCluster {
            metadata: ObjectMeta {
                name: Some("eclipse-che".to_string()),
                namespace: Some("che".to_string()),
                ..Default::default()
            },
            spec: CheClusterSpec::default(),
            status: None,
        };
        apply_defaults(&mut cluster);
        cluster
    }

    #[test]
    fn test_deployment_has_probes_by_default() {
        let cluster = defaulted_cluster();
        let deployment = generate_deployment(&cluster, "che", &ImageDefaults::from_env());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        assert!(containers[0].readiness_probe.is_some());
        assert!(containers[0].liveness_probe.is_some());
    }

    #[test]
    fn test_debug_mode_omits_probes() {
        let mut cluster = defaulted_cluster();
        cluster.spec.server.che_debug = true;
        let deployment = generate_deployment(&cluster, "che", &ImageDefaults::from_env());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        assert!(containers[0].readiness_probe.is_none());
        assert!(containers[0].liveness_probe.is_none());
    }

    #[test]
    fn test_database_address_follows_flavor() {
        let cluster = defaulted_cluster();
        let deployment = generate_deployment(&cluster, "che", &ImageDefaults::from_env());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        let env = containers[0].env.as_ref().unwrap();
        let addr = env.iter().find(|e| e.name == "DB_ADDR").unwrap();
        assert_eq!(addr.value.as_deref(), Some(POSTGRES_SERVICE_NAME));

        let mut external = defaulted_cluster();
        external.spec.database.external_db = true;
        external.spec.database.che_postgres_hostname = "db.corp".to_string();
        let deployment = generate_deployment(&external, "che", &ImageDefaults::from_env());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        let env = containers[0].env.as_ref().unwrap();
        let addr = env.iter().find(|e| e.name == "DB_ADDR").unwrap();
        assert_eq!(addr.value.as_deref(), Some("db.corp"));
    }
}
