//! Devfile and plugin registries plus the dashboard.
//!
//! Each registry is a stateless Deployment + Service pair serving static
//! content; the dashboard is the user-facing UI behind the gateway.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use std::time::Duration;

use crate::controller::error::Result;
use crate::crd::CheCluster;
use crate::deploy::{
    DASHBOARD_NAME, DEVFILE_REGISTRY_NAME, DeployContext, PLUGIN_REGISTRY_NAME, ReconcileFlow,
    Reconcilable, component_labels, component_selector, owner_reference,
};
use crate::sync::sync_object;

const REGISTRY_PORT: i32 = 8080;

/// One stateless HTTP workload: name, image and probe path
struct StatelessWorkload {
    name: &'static str,
    image: String,
    probe_path: &'static str,
}

fn generate_workload_deployment(
    cluster: &CheCluster,
    namespace: &str,
    workload: &StatelessWorkload,
    extra_env: Vec<EnvVar>,
) -> Deployment {
    let probe = |initial_delay: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(workload.probe_path.to_string()),
            port: IntOrString::Int(REGISTRY_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(3),
        ..Default::default()
    };

    // Debug installs skip probes across all managed workloads
    let (readiness, liveness) = if cluster.spec.server.che_debug {
        (None, None)
    } else {
        (Some(probe(10)), Some(probe(30)))
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(workload.name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(workload.name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(component_selector(workload.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(component_labels(workload.name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: workload.name.to_string(),
                        image: Some(workload.image.clone()),
                        env: if extra_env.is_empty() {
                            None
                        } else {
                            Some(extra_env)
                        },
                        ports: Some(vec![ContainerPort {
                            container_port: REGISTRY_PORT,
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

fn generate_workload_service(cluster: &CheCluster, namespace: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(component_selector(name)),
            ports: Some(vec![ServicePort {
                port: REGISTRY_PORT,
                target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                name: Some("http".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct RegistriesReconciler;

#[async_trait]
impl Reconcilable for RegistriesReconciler {
    fn name(&self) -> &'static str {
        "registries"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let workloads = [
            StatelessWorkload {
                name: DEVFILE_REGISTRY_NAME,
                image: ctx.images.devfile_registry_image(&ctx.che_cluster),
                probe_path: "/devfiles/",
            },
            StatelessWorkload {
                name: PLUGIN_REGISTRY_NAME,
                image: ctx.images.plugin_registry_image(&ctx.che_cluster),
                probe_path: "/v3/plugins/",
            },
        ];

        let mut in_sync = true;
        for workload in &workloads {
            let external_url = if ctx.che_host.is_empty() {
                String::new()
            } else {
                format!("{}://{}/{}", ctx.scheme(), ctx.che_host, workload.name)
            };
            let env = if external_url.is_empty() {
                Vec::new()
            } else {
                vec![EnvVar {
                    name: "CHE_PUBLIC_URL".to_string(),
                    value: Some(external_url),
                    ..Default::default()
                }]
            };

            let deployment =
                generate_workload_deployment(&ctx.che_cluster, &ctx.namespace, workload, env);
            in_sync &= sync_object(&ctx.client, &ctx.namespace, deployment).await?;

            let service = generate_workload_service(&ctx.che_cluster, &ctx.namespace, workload.name);
            in_sync &= sync_object(&ctx.client, &ctx.namespace, service).await?;
        }

        if in_sync {
            Ok(ReconcileFlow::Done)
        } else {
            Ok(ReconcileFlow::Requeue(Duration::from_secs(1)))
        }
    }
}

pub struct DashboardReconciler;

#[async_trait]
impl Reconcilable for DashboardReconciler {
    fn name(&self) -> &'static str {
        "dashboard"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let workload = StatelessWorkload {
            name: DASHBOARD_NAME,
            image: ctx.images.dashboard_image(&ctx.che_cluster),
            probe_path: "/dashboard/",
        };

        let env = vec![EnvVar {
            name: "CHE_HOST".to_string(),
            value: Some(ctx.che_host.clone()),
            ..Default::default()
        }];

        let deployment =
            generate_workload_deployment(&ctx.che_cluster, &ctx.namespace, &workload, env);
        let mut in_sync = sync_object(&ctx.client, &ctx.namespace, deployment).await?;

        let service = generate_workload_service(&ctx.che_cluster, &ctx.namespace, DASHBOARD_NAME);
        in_sync &= sync_object(&ctx.client, &ctx.namespace, service).await?;

        if in_sync {
            Ok(ReconcileFlow::Done)
        } else {
            Ok(ReconcileFlow::Requeue(Duration::from_secs(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CheClusterSpec;

    fn cluster() -> CheCluster {
        CheCluster {
            metadata: ObjectMeta {
                name: Some("eclipse-che".to_string()),
                namespace: Some("che".to_string()),
                ..Default::default()
            },
            spec: CheClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_registry_deployment_labels_and_probes() {
        let workload = StatelessWorkload {
            name: DEVFILE_REGISTRY_NAME,
            image: "quay.io/eclipse/che-devfile-registry:7.30".to_string(),
            probe_path: "/devfiles/",
        };
        let deployment = generate_workload_deployment(&cluster(), "che", &workload, Vec::new());

        assert_eq!(
            deployment.metadata.labels.unwrap().get("app.kubernetes.io/component"),
            Some(&DEVFILE_REGISTRY_NAME.to_string())
        );
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        let probe = containers[0].readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.http_get.as_ref().unwrap().path.as_deref(),
            Some("/devfiles/")
        );
    }

    #[test]
    fn test_debug_mode_omits_registry_probes() {
        let mut cluster = cluster();
        cluster.spec.server.che_debug = true;
        let workload = StatelessWorkload {
            name: PLUGIN_REGISTRY_NAME,
            image: "quay.io/eclipse/che-plugin-registry:7.30".to_string(),
            probe_path: "/v3/plugins/",
        };
        let deployment = generate_workload_deployment(&cluster, "che", &workload, Vec::new());
        let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
        assert!(containers[0].readiness_probe.is_none());
    }

    #[test]
    fn test_service_selector_matches_deployment() {
        let service = generate_workload_service(&cluster(), "che", DASHBOARD_NAME);
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(
            selector.get("app.kubernetes.io/component"),
            Some(&DASHBOARD_NAME.to_string())
        );
    }
}
