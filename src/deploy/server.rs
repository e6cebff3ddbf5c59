//! Che server configuration and deployment.
//!
//! Split into two pipeline steps: the config layer renders the server
//! config map, and the deployment layer rolls out the server pods. The
//! deployment records the config map's resourceVersion in a `CM_REVISION`
//! env var, so any config change alters the pod template and triggers a
//! rolling update.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, HTTPGetAction,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort, ServiceSpec,
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
use crate::deploy::database::pod_security_context;
use crate::deploy::{
    CHE_SERVICE_ACCOUNT, DeployContext, IDENTITY_PROVIDER_SERVICE_NAME, MERGED_CA_BUNDLE_NAME,
    ReconcileFlow, Reconcilable, SERVER_CONFIG_MAP_NAME, SERVER_DEPLOYMENT_NAME,
    SERVER_SERVICE_NAME, component_labels, component_selector, owner_reference,
};
use crate::platform::ProxySettings;
use crate::sync::sync_object;

const COMPONENT: &str = "che-server";
const SERVER_PORT: i32 = 8080;

/// Env var carrying the config map revision into the pod template
pub const CM_REVISION_ENV: &str = "CM_REVISION";

/// Render the server configuration entries.
///
/// Custom properties from the CR are merged last, so users can override any
/// computed entry.
pub fn server_properties(
    cluster: &CheCluster,
    che_host: &str,
    proxy: &ProxySettings,
    tls: bool,
) -> BTreeMap<String, String> {
    let spec = &cluster.spec;
    let scheme = if tls { "https" } else { "http" };
    let mut properties = BTreeMap::new();

    properties.insert("CHE_HOST".to_string(), che_host.to_string());
    if !che_host.is_empty() {
        properties.insert(
            "CHE_API".to_string(),
            format!("{}://{}/api", scheme, che_host),
        );
        properties.insert(
            "CHE_WEBSOCKET_ENDPOINT".to_string(),
            format!(
                "{}://{}/api/websocket",
                if tls { "wss" } else { "ws" },
                che_host
            ),
        );
    }
    properties.insert(
        "CHE_LOG_LEVEL".to_string(),
        spec.server.che_log_level.clone(),
    );
    properties.insert("CHE_DEBUG_SERVER".to_string(), spec.server.che_debug.to_string());

    properties.insert(
        "CHE_JDBC_URL".to_string(),
        format!(
            "jdbc:postgresql://{}:{}/{}",
            spec.database.che_postgres_hostname,
            spec.database.che_postgres_port,
            spec.database.che_postgres_db
        ),
    );

    let identity_url = if spec.auth.external_identity_provider {
        spec.auth.identity_provider_url.clone()
    } else if !che_host.is_empty() {
        format!("{}://{}/auth", scheme, che_host)
    } else {
        format!("http://{}:8080/auth", IDENTITY_PROVIDER_SERVICE_NAME)
    };
    properties.insert("CHE_KEYCLOAK_AUTH__SERVER__URL".to_string(), identity_url);
    properties.insert(
        "CHE_KEYCLOAK_REALM".to_string(),
        spec.auth.identity_provider_realm.clone(),
    );
    properties.insert(
        "CHE_KEYCLOAK_CLIENT__ID".to_string(),
        spec.auth.identity_provider_client_id.clone(),
    );

    properties.insert(
        "CHE_INFRA_KUBERNETES_PVC_STRATEGY".to_string(),
        spec.storage.pvc_strategy.clone(),
    );
    properties.insert(
        "CHE_INFRA_KUBERNETES_PVC_QUANTITY".to_string(),
        spec.storage.pvc_claim_size.clone(),
    );
    if !spec.storage.workspace_pvc_storage_class_name.is_empty() {
        properties.insert(
            "CHE_INFRA_KUBERNETES_PVC_STORAGE__CLASS__NAME".to_string(),
            spec.storage.workspace_pvc_storage_class_name.clone(),
        );
    }

    if proxy.is_configured() {
        properties.insert("CHE_WORKSPACE_HTTP__PROXY".to_string(), proxy.http_proxy.clone());
        properties.insert(
            "CHE_WORKSPACE_HTTPS__PROXY".to_string(),
            proxy.https_proxy.clone(),
        );
        properties.insert("CHE_WORKSPACE_NO__PROXY".to_string(), proxy.no_proxy.clone());
    }

    if spec.metrics.as_ref().is_some_and(|m| m.enable) {
        properties.insert("CHE_METRICS_ENABLED".to_string(), "true".to_string());
    }

    // User overrides win
    for (key, value) in &spec.server.custom_che_properties {
        properties.insert(key.clone(), value.clone());
    }

    properties
}

pub struct ServerConfigReconciler;

#[async_trait]
impl Reconcilable for ServerConfigReconciler {
    fn name(&self) -> &'static str {
        "server-config"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let properties = server_properties(
            &ctx.che_cluster,
            &ctx.che_host,
            &ctx.proxy,
            ctx.tls_enabled(),
        );

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(SERVER_CONFIG_MAP_NAME.to_string()),
                namespace: Some(ctx.namespace.clone()),
                labels: Some(component_labels(COMPONENT)),
                owner_references: Some(vec![owner_reference(&ctx.che_cluster)]),
                ..Default::default()
            },
            data: Some(properties),
            ..Default::default()
        };

        sync_object(&ctx.client, &ctx.namespace, config_map).await?;
        Ok(ReconcileFlow::Done)
    }
}

pub struct ServerDeploymentReconciler;

#[async_trait]
impl Reconcilable for ServerDeploymentReconciler {
    fn name(&self) -> &'static str {
        "server-deployment"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        // The pod template embeds the config map revision; a config change
        // therefore rolls the pods
        let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let cm_revision = config_maps
            .get_opt(SERVER_CONFIG_MAP_NAME)
            .await?
            .and_then(|cm| cm.metadata.resource_version)
            .unwrap_or_default();

        let deployment =
            generate_deployment(&ctx.che_cluster, &ctx.namespace, ctx, &cm_revision);
        let mut in_sync = sync_object(&ctx.client, &ctx.namespace, deployment).await?;

        let service = generate_service(&ctx.che_cluster, &ctx.namespace);
        in_sync &= sync_object(&ctx.client, &ctx.namespace, service).await?;

        if in_sync {
            Ok(ReconcileFlow::Done)
        } else {
            Ok(ReconcileFlow::Requeue(Duration::from_secs(1)))
        }
    }
}

/// HTTP probe against the server state endpoint
fn server_probe(path: &str, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(SERVER_PORT),
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
    ctx: &DeployContext,
    cm_revision: &str,
) -> Deployment {
    // Debug installs skip probes so a paused JVM is not restarted
    let (readiness, liveness) = if cluster.spec.server.che_debug {
        (None, None)
    } else {
        (
            Some(server_probe("/api/system/state", 30)),
            Some(server_probe("/api/system/state", 120)),
        )
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(SERVER_DEPLOYMENT_NAME.to_string()),
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
                    service_account_name: Some(CHE_SERVICE_ACCOUNT.to_string()),
                    security_context: pod_security_context(cluster),
                    containers: vec![Container {
                        name: COMPONENT.to_string(),
                        image: Some(ctx.images.che_server_image(cluster)),
                        env: Some(vec![
                            EnvVar {
                                name: CM_REVISION_ENV.to_string(),
                                value: Some(cm_revision.to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "JAVA_OPTS".to_string(),
                                value: Some(format!(
                                    "-Djavax.net.ssl.trustStorePassword= -Dche.ca.bundle={}",
                                    MERGED_CA_BUNDLE_NAME
                                )),
                                ..Default::default()
                            },
                        ]),
                        env_from: Some(vec![EnvFromSource {
                            config_map_ref: Some(ConfigMapEnvSource {
                                name: SERVER_CONFIG_MAP_NAME.to_string(),
                                optional: Some(false),
                            }),
                            ..Default::default()
                        }]),
                        ports: Some(vec![ContainerPort {
                            container_port: SERVER_PORT,
                            name: Some("http".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: readiness,
                        liveness_probe: liveness,
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("memory".to_string(), Quantity("512Mi".to_string())),
                                ("cpu".to_string(), Quantity("100m".to_string())),
                            ])),
                            limits: Some(BTreeMap::from([(
                                "memory".to_string(),
                                Quantity("1Gi".to_string()),
                            )])),
                            ..Default::default()
                        }),
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
            name: Some(SERVER_SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels(COMPONENT)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(component_selector(COMPONENT)),
            ports: Some(vec![ServicePort {
                port: SERVER_PORT,
                target_port: Some(IntOrString::Int(SERVER_PORT)),
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
    fn test_properties_carry_host_and_scheme() {
        let cluster = defaulted_cluster();
        let proxy = ProxySettings::default();
        let properties = server_properties(&cluster, "che.example.com", &proxy, true);
        assert_eq!(
            properties.get("CHE_API"),
            Some(&"https://che.example.com/api".to_string())
        );
        assert_eq!(
            properties.get("CHE_WEBSOCKET_ENDPOINT"),
            Some(&"wss://che.example.com/api/websocket".to_string())
        );
    }

    #[test]
    fn test_custom_properties_override_computed() {
        let mut cluster = defaulted_cluster();
        cluster
            .spec
            .server
            .custom_che_properties
            .insert("CHE_LOG_LEVEL".to_string(), "TRACE".to_string());
        let properties =
            server_properties(&cluster, "che.example.com", &ProxySettings::default(), false);
        assert_eq!(properties.get("CHE_LOG_LEVEL"), Some(&"TRACE".to_string()));
    }

    #[test]
    fn test_jdbc_url_from_database_spec() {
        let cluster = defaulted_cluster();
        let properties =
            server_properties(&cluster, "che.example.com", &ProxySettings::default(), false);
        assert_eq!(
            properties.get("CHE_JDBC_URL"),
            Some(&"jdbc:postgresql://postgres:5432/dbche".to_string())
        );
    }

    #[test]
    fn test_proxy_properties_present_when_configured() {
        let cluster = defaulted_cluster();
        let proxy = ProxySettings {
            http_proxy: "http://proxy.corp:3128".to_string(),
            https_proxy: "http://proxy.corp:3128".to_string(),
            no_proxy: "kubernetes.default.svc".to_string(),
        };
        let properties = server_properties(&cluster, "che.example.com", &proxy, false);
        assert_eq!(
            properties.get("CHE_WORKSPACE_HTTP__PROXY"),
            Some(&"http://proxy.corp:3128".to_string())
        );
    }

    #[test]
    fn test_probes_target_system_state() {
        let probe = server_probe("/api/system/state", 30);
        assert_eq!(
            probe.http_get.unwrap().path.as_deref(),
            Some("/api/system/state")
        );
    }
}
