//! Managed Postgres deployment.
//!
//! Owns the database Deployment, Service and data volume. Skipped entirely
//! for externally managed databases; the spec then names the host, port and
//! credentials secret and the server just consumes them.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::controller::error::Result;
use crate::crd::CheCluster;
use crate::deploy::{
    DeployContext, POSTGRES_DEPLOYMENT_NAME, POSTGRES_SERVICE_NAME, ReconcileFlow, Reconcilable,
    component_labels, component_selector, owner_reference,
};
use crate::platform::ImageDefaults;
use crate::sync::sync_object;

const COMPONENT: &str = "postgres";
const DATA_VOLUME: &str = "postgres-data";
const POSTGRES_PORT: i32 = 5432;

pub struct DatabaseReconciler;

#[async_trait]
impl Reconcilable for DatabaseReconciler {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        if ctx.che_cluster.spec.database.external_db {
            // Nothing to deploy; the server consumes the external endpoint
            set_db_provisioned(ctx);
            return Ok(ReconcileFlow::Done);
        }

        let pvc = generate_data_pvc(&ctx.che_cluster, &ctx.namespace);
        sync_object(&ctx.client, &ctx.namespace, pvc).await?;

        let deployment = generate_deployment(&ctx.che_cluster, &ctx.namespace, &ctx.images);
        let mut in_sync = sync_object(&ctx.client, &ctx.namespace, deployment).await?;

        let service = generate_service(&ctx.che_cluster, &ctx.namespace);
        in_sync &= sync_object(&ctx.client, &ctx.namespace, service).await?;

        if !in_sync {
            return Ok(ReconcileFlow::Requeue(Duration::from_secs(1)));
        }

        // Downstream layers (identity provider, server) need a reachable
        // database; gate on readiness
        let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let ready = deployments
            .get_opt(POSTGRES_DEPLOYMENT_NAME)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.available_replicas)
            .unwrap_or(0)
            >= 1;

        if !ready {
            return Ok(ReconcileFlow::Requeue(Duration::from_secs(5)));
        }

        set_db_provisioned(ctx);
        Ok(ReconcileFlow::Done)
    }
}

fn set_db_provisioned(ctx: &mut DeployContext) {
    ctx.che_cluster
        .status
        .get_or_insert_default()
        .db_provisioned = true;
}

fn generate_data_pvc(cluster: &CheCluster, namespace: &str) -> PersistentVolumeClaim {
    let storage = &cluster.spec.storage;
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(if storage.pvc_claim_size.is_empty() {
                        "1Gi".to_string()
                    } else {
                        storage.pvc_claim_size.clone()
                    }),
                )])),
                ..Default::default()
            }),
            storage_class_name: if storage.workspace_pvc_storage_class_name.is_empty() {
                None
            } else {
                Some(storage.workspace_pvc_storage_class_name.clone())
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Exec probe: pg_isready exits non-zero until Postgres accepts connections
fn postgres_probe(initial_delay: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "pg_isready -U postgres".to_string(),
            ]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(6),
        ..Default::default()
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

fn generate_deployment(
    cluster: &CheCluster,
    namespace: &str,
    images: &ImageDefaults,
) -> Deployment {
    let database = &cluster.spec.database;

    let env = vec![
        secret_env("POSTGRESQL_USER", &database.che_postgres_secret, "user"),
        secret_env(
            "POSTGRESQL_PASSWORD",
            &database.che_postgres_secret,
            "password",
        ),
        EnvVar {
            name: "POSTGRESQL_DATABASE".to_string(),
            value: Some(database.che_postgres_db.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "PGDATA".to_string(),
            value: Some("/var/lib/pgsql/data/pgdata".to_string()),
            ..Default::default()
        },
    ];

    Deployment {
        metadata: ObjectMeta {
            name: Some(POSTGRES_DEPLOYMENT_NAME.to_string()),
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
                        image: Some(images.postgres_image(cluster)),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            container_port: POSTGRES_PORT,
                            name: Some("postgres".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: Some(postgres_probe(15)),
                        liveness_probe: Some(postgres_probe(30)),
                        volume_mounts: Some(vec![VolumeMount {
                            name: DATA_VOLUME.to_string(),
                            mount_path: "/var/lib/pgsql/data".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: DATA_VOLUME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
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
            name: Some(POSTGRES_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(component_selector(COMPONENT)),
            ports: Some(vec![ServicePort {
                port: POSTGRES_PORT,
                target_port: Some(IntOrString::Int(POSTGRES_PORT)),
                name: Some("postgres".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Security context ids from the CR, when set
pub(crate) fn pod_security_context(
    cluster: &CheCluster,
) -> Option<k8s_openapi::api::core::v1::PodSecurityContext> {
    let k8s = &cluster.spec.k8s;
    let run_as_user = k8s.security_context_run_as_user.parse::<i64>().ok();
    let fs_group = k8s.security_context_fs_group.parse::<i64>().ok();

    if run_as_user.is_none() && fs_group.is_none() {
        return None;
    }

    Some(k8s_openapi::api::core::v1::PodSecurityContext {
        run_as_user,
        fs_group,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CheClusterSpec;
    use crate::deploy::defaults::apply_defaults;
    use crate::platform::ImageDefaults;

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
    fn test_deployment_env_from_secret() {
        let cluster = defaulted_cluster();
        let deployment = generate_deployment(&cluster, "che", &ImageDefaults::from_env());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        let env = containers[0].env.as_ref().unwrap();

        let user = env.iter().find(|e| e.name == "POSTGRESQL_USER").unwrap();
        assert_eq!(
            user.value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap()
                .name,
            "che-postgres-secret"
        );

        let db = env.iter().find(|e| e.name == "POSTGRESQL_DATABASE").unwrap();
        assert_eq!(db.value.as_deref(), Some("dbche"));
    }

    #[test]
    fn test_pvc_uses_claim_size() {
        let cluster = defaulted_cluster();
        let pvc = generate_data_pvc(&cluster, "che");
        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "10Gi");
    }

    #[test]
    fn test_probes_use_pg_isready() {
        let cluster = defaulted_cluster();
        let deployment = generate_deployment(&cluster, "che", &ImageDefaults::from_env());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        let probe = containers[0].readiness_probe.as_ref().unwrap();
        let command = probe.exec.as_ref().unwrap().command.as_ref().unwrap();
        assert!(command.iter().any(|c| c.contains("pg_isready")));
    }

    #[test]
    fn test_security_context_parsed() {
        let mut spec = CheClusterSpec::default();
        spec.k8s.security_context_run_as_user = "1724".to_string();
        spec.k8s.security_context_fs_group = "1724".to_string();
        let cluster = CheCluster {
            metadata: ObjectMeta::default(),
            spec,
            status: None,
        };
        let sc = pod_security_context(&cluster).unwrap();
        assert_eq!(sc.run_as_user, Some(1724));
        assert_eq!(sc.fs_group, Some(1724));
    }

    #[test]
    fn test_no_security_context_when_unset() {
        let cluster = CheCluster {
            metadata: ObjectMeta::default(),
            spec: CheClusterSpec::default(),
            status: None,
        };
        assert!(pod_security_context(&cluster).is_none());
    }
}
