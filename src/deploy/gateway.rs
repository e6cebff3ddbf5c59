//! Single-host gateway and host exposure.
//!
//! The whole installation is served under one public hostname. On base
//! clusters that is an Ingress with nginx annotations and an optional TLS
//! secret; on extended clusters a Route with edge TLS termination, whose
//! hostname the platform assigns. The resolved host is written back to
//! `spec.server.cheHost` when the user left it empty.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind, ObjectMeta};
use serde_json::json;
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::CheCluster;
use crate::deploy::{
    DASHBOARD_NAME, DEVFILE_REGISTRY_NAME, DeployContext, GATEWAY_INGRESS_NAME,
    IDENTITY_PROVIDER_SERVICE_NAME, PLUGIN_REGISTRY_NAME, ReconcileFlow, Reconcilable,
    SERVER_SERVICE_NAME, component_labels, owner_reference,
};
use crate::platform::Infrastructure;
use crate::sync::sync_object;

/// Name of the Route on extended clusters
const GATEWAY_ROUTE_NAME: &str = "che";

/// Path routing behind the single host: `(path, service, port)`
fn gateway_paths() -> Vec<(&'static str, &'static str, i32)> {
    vec![
        ("/", SERVER_SERVICE_NAME, 8080),
        ("/auth", IDENTITY_PROVIDER_SERVICE_NAME, 8080),
        ("/dashboard", DASHBOARD_NAME, 8080),
        ("/devfile-registry", DEVFILE_REGISTRY_NAME, 8080),
        ("/plugin-registry", PLUGIN_REGISTRY_NAME, 8080),
    ]
}

/// Hostname for base clusters: the user-set host, or `che-<ns>.<domain>`
pub fn ingress_hostname(cluster: &CheCluster, namespace: &str) -> Result<String> {
    if !cluster.spec.server.che_host.is_empty() {
        return Ok(cluster.spec.server.che_host.clone());
    }
    let domain = &cluster.spec.k8s.ingress_domain;
    if domain.is_empty() {
        return Err(Error::ValidationError(
            "spec.k8s.ingressDomain is required when spec.server.cheHost is empty".to_string(),
        ));
    }
    Ok(format!("che-{}.{}", namespace, domain))
}

/// Build the Ingress for base clusters
pub fn generate_ingress(cluster: &CheCluster, namespace: &str, host: &str) -> Ingress {
    let tls_enabled = cluster.spec.server.tls_support;

    let mut annotations = BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/proxy-read-timeout".to_string(),
            "3600".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-connect-timeout".to_string(),
            "3600".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            tls_enabled.to_string(),
        ),
    ]);
    if !cluster.spec.k8s.ingress_class.is_empty() {
        annotations.insert(
            "kubernetes.io/ingress.class".to_string(),
            cluster.spec.k8s.ingress_class.clone(),
        );
    }

    let paths: Vec<HTTPIngressPath> = gateway_paths()
        .into_iter()
        .map(|(path, service, port)| HTTPIngressPath {
            path: Some(path.to_string()),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(ServiceBackendPort {
                        number: Some(port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    let tls = if tls_enabled {
        Some(vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: if cluster.spec.k8s.tls_secret_name.is_empty() {
                None
            } else {
                Some(cluster.spec.k8s.tls_secret_name.clone())
            },
        }])
    } else {
        None
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(GATEWAY_INGRESS_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(component_labels("che-gateway")),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: if cluster.spec.k8s.ingress_class.is_empty() {
                None
            } else {
                Some(cluster.spec.k8s.ingress_class.clone())
            },
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            tls,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The Route API on extended clusters, accessed dynamically since it is not
/// part of the core API surface
fn route_api(ctx: &DeployContext) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
    let resource = ApiResource::from_gvk(&gvk);
    Api::namespaced_with(ctx.client.clone(), &ctx.namespace, &resource)
}

pub struct GatewayReconciler;

#[async_trait]
impl Reconcilable for GatewayReconciler {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        match ctx.infrastructure {
            Infrastructure::Base => {
                let host = ingress_hostname(&ctx.che_cluster, &ctx.namespace)?;
                let ingress = generate_ingress(&ctx.che_cluster, &ctx.namespace, &host);
                sync_object(&ctx.client, &ctx.namespace, ingress).await?;
                ctx.che_host = host;
                Ok(ReconcileFlow::Done)
            }
            Infrastructure::Extended => self.reconcile_route(ctx).await,
        }
    }
}

impl GatewayReconciler {
    /// Route with edge TLS termination; the platform assigns the hostname
    /// when the CR leaves it empty
    async fn reconcile_route(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let api = route_api(ctx);

        let mut spec = json!({
            "to": {"kind": "Service", "name": SERVER_SERVICE_NAME},
            "port": {"targetPort": "http"},
            "tls": {"termination": "edge", "insecureEdgeTerminationPolicy": "Redirect"},
        });
        if !ctx.che_cluster.spec.server.che_host.is_empty() {
            spec["host"] = json!(ctx.che_cluster.spec.server.che_host);
        }

        match api.get_opt(GATEWAY_ROUTE_NAME).await? {
            None => {
                let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
                let resource = ApiResource::from_gvk(&gvk);
                let mut route = DynamicObject::new(GATEWAY_ROUTE_NAME, &resource);
                route.metadata.namespace = Some(ctx.namespace.clone());
                route.metadata.labels = Some(component_labels("che-gateway"));
                route.metadata.owner_references = Some(vec![owner_reference(&ctx.che_cluster)]);
                route.data = json!({ "spec": spec });

                api.create(&PostParams::default(), &route).await?;
                // The router has not admitted the route yet
                Ok(ReconcileFlow::Requeue(Duration::from_secs(2)))
            }
            Some(route) => {
                let assigned_host = route
                    .data
                    .pointer("/spec/host")
                    .and_then(|h| h.as_str())
                    .unwrap_or_default()
                    .to_string();

                if assigned_host.is_empty() {
                    return Ok(ReconcileFlow::Requeue(Duration::from_secs(2)));
                }

                ctx.default_che_host = assigned_host.clone();
                ctx.che_host = if ctx.che_cluster.spec.server.che_host.is_empty() {
                    assigned_host
                } else {
                    ctx.che_cluster.spec.server.che_host.clone()
                };
                Ok(ReconcileFlow::Done)
            }
        }
    }
}

pub struct HostExposureReconciler;

#[async_trait]
impl Reconcilable for HostExposureReconciler {
    fn name(&self) -> &'static str {
        "host-exposure"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        if ctx.che_host.is_empty() {
            // The gateway has not produced a hostname yet
            return Ok(ReconcileFlow::Requeue(Duration::from_secs(2)));
        }

        if ctx.che_cluster.spec.server.che_host.is_empty() {
            let api: Api<CheCluster> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
            let patch = json!({ "spec": { "server": { "cheHost": &ctx.che_host } } });
            api.patch(
                &ctx.cluster_name(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
            ctx.che_cluster.spec.server.che_host = ctx.che_host.clone();
            info!(host = %ctx.che_host, "Recorded resolved hostname in the CheCluster spec");
        }

        Ok(ReconcileFlow::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CheClusterSpec;

    fn cluster(spec: CheClusterSpec) -> CheCluster {
        CheCluster {
            metadata: ObjectMeta {
                name: Some("eclipse-che".to_string()),
                namespace: Some("che".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn test_hostname_from_ingress_domain() {
        let mut spec = CheClusterSpec::default();
        spec.k8s.ingress_domain = "apps.example.com".to_string();
        let host = ingress_hostname(&cluster(spec), "eclipse-che").unwrap();
        assert_eq!(host, "che-eclipse-che.apps.example.com");
    }

    #[test]
    fn test_hostname_prefers_spec_value() {
        let mut spec = CheClusterSpec::default();
        spec.server.che_host = "che.corp".to_string();
        spec.k8s.ingress_domain = "apps.example.com".to_string();
        let host = ingress_hostname(&cluster(spec), "eclipse-che").unwrap();
        assert_eq!(host, "che.corp");
    }

    #[test]
    fn test_hostname_requires_domain() {
        let err = ingress_hostname(&cluster(CheClusterSpec::default()), "che").unwrap_err();
        assert!(err.to_string().contains("ingressDomain"));
    }

    #[test]
    fn test_ingress_tls_section() {
        let mut spec = CheClusterSpec::default();
        spec.server.tls_support = true;
        spec.k8s.tls_secret_name = "che-tls".to_string();
        spec.k8s.ingress_domain = "apps.example.com".to_string();
        let c = cluster(spec);
        let ingress = generate_ingress(&c, "che", "che.apps.example.com");

        let tls = ingress.spec.as_ref().unwrap().tls.as_ref().unwrap();
        assert_eq!(tls[0].secret_name.as_deref(), Some("che-tls"));
        assert_eq!(
            tls[0].hosts.as_ref().unwrap()[0],
            "che.apps.example.com"
        );

        let annotations = ingress.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("nginx.ingress.kubernetes.io/ssl-redirect"),
            Some(&"true".to_string())
        );
    }

    #[test]
    fn test_ingress_without_tls() {
        let mut spec = CheClusterSpec::default();
        spec.k8s.ingress_domain = "apps.example.com".to_string();
        let c = cluster(spec);
        let ingress = generate_ingress(&c, "che", "che.apps.example.com");
        assert!(ingress.spec.unwrap().tls.is_none());
    }

    #[test]
    fn test_ingress_routes_all_components() {
        let mut spec = CheClusterSpec::default();
        spec.k8s.ingress_domain = "apps.example.com".to_string();
        let c = cluster(spec);
        let ingress = generate_ingress(&c, "che", "che.apps.example.com");
        let rules = ingress.spec.unwrap().rules.unwrap();
        let paths = &rules[0].http.as_ref().unwrap().paths;
        let backends: Vec<&str> = paths
            .iter()
            .map(|p| p.backend.service.as_ref().unwrap().name.as_str())
            .collect();
        assert!(backends.contains(&SERVER_SERVICE_NAME));
        assert!(backends.contains(&DASHBOARD_NAME));
        assert!(backends.contains(&IDENTITY_PROVIDER_SERVICE_NAME));
    }
}
