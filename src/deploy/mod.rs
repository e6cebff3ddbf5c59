//! DeployContext and the ordered CheCluster sub-reconcilers.
//!
//! Each sub-reconciler owns one concern of the installation. The top-level
//! reconciler runs them strictly in order; the first one that is not done
//! short-circuits the pass. On CR deletion they are finalized in reverse
//! order.

pub mod certificates;
pub mod context;
pub mod database;
pub mod defaults;
pub mod devworkspace;
pub mod gateway;
pub mod identity;
pub mod permissions;
pub mod registries;
pub mod server;

pub use certificates::CertificatesReconciler;
pub use context::DeployContext;
pub use database::DatabaseReconciler;
pub use defaults::DefaultsReconciler;
pub use devworkspace::DevWorkspaceReconciler;
pub use gateway::GatewayReconciler;
pub use identity::IdentityProviderReconciler;
pub use permissions::PermissionsReconciler;
pub use registries::RegistriesReconciler;
pub use server::{ServerConfigReconciler, ServerDeploymentReconciler};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::controller::error::Result;
use crate::crd::CheCluster;

/// API version of the CheCluster CRD
pub const API_VERSION: &str = "org.eclipse.che/v1";

/// Kind of the CheCluster CRD
pub const KIND: &str = "CheCluster";

/// Service account the managed workloads run as
pub const CHE_SERVICE_ACCOUNT: &str = "che";

/// Workload object names
pub const SERVER_DEPLOYMENT_NAME: &str = "che";
pub const SERVER_SERVICE_NAME: &str = "che-host";
pub const SERVER_CONFIG_MAP_NAME: &str = "che";
pub const POSTGRES_DEPLOYMENT_NAME: &str = "postgres";
pub const POSTGRES_SERVICE_NAME: &str = "postgres";
pub const POSTGRES_CREDENTIALS_SECRET: &str = "che-postgres-secret";
pub const IDENTITY_PROVIDER_DEPLOYMENT_NAME: &str = "keycloak";
pub const IDENTITY_PROVIDER_SERVICE_NAME: &str = "keycloak";
pub const IDENTITY_PROVIDER_SECRET: &str = "che-identity-secret";
pub const DEVFILE_REGISTRY_NAME: &str = "devfile-registry";
pub const PLUGIN_REGISTRY_NAME: &str = "plugin-registry";
pub const DASHBOARD_NAME: &str = "che-dashboard";
pub const GATEWAY_INGRESS_NAME: &str = "che-ingress";
pub const MERGED_CA_BUNDLE_NAME: &str = "ca-certs-merged";

/// Label selector identifying CA-bundle config maps
pub const CA_BUNDLE_SELECTOR: &str =
    "app.kubernetes.io/component=ca-bundle,app.kubernetes.io/part-of=che.eclipse.org";

/// Flow control returned by a sub-reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileFlow {
    /// This concern has converged; the pipeline continues
    Done,
    /// This concern needs another pass after the given delay
    Requeue(Duration),
}

/// One concern of the CheCluster installation.
///
/// `reconcile` converges the concern; `finalize` undoes whatever cannot be
/// garbage-collected through owner references and returns `true` once
/// nothing is left.
#[async_trait]
pub trait Reconcilable: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow>;

    async fn finalize(&self, _ctx: &DeployContext) -> Result<bool> {
        Ok(true)
    }
}

/// The sub-reconciler pipeline, in dependency order
pub fn pipeline() -> Vec<Box<dyn Reconcilable>> {
    vec![
        Box::new(DefaultsReconciler),
        Box::new(PermissionsReconciler),
        Box::new(CertificatesReconciler),
        Box::new(DatabaseReconciler),
        Box::new(IdentityProviderReconciler),
        Box::new(ServerConfigReconciler),
        Box::new(ServerDeploymentReconciler),
        Box::new(RegistriesReconciler),
        Box::new(GatewayReconciler),
        Box::new(DashboardReconciler),
        Box::new(HostExposureReconciler),
        Box::new(DevWorkspaceReconciler),
    ]
}

pub use gateway::HostExposureReconciler;
pub use registries::DashboardReconciler;

/// Owner reference pointing at the CheCluster, so namespaced objects are
/// garbage-collected with it
pub fn owner_reference(cluster: &CheCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Standard labels for a managed component
pub fn component_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "che".to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
        (
            "app.kubernetes.io/part-of".to_string(),
            "che.eclipse.org".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "che-operator".to_string(),
        ),
    ])
}

/// Pod selector for a managed component
pub fn component_selector(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "che".to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            component.to_string(),
        ),
        (
            "app.kubernetes.io/part-of".to_string(),
            "che.eclipse.org".to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_labels() {
        let labels = component_labels("che-server");
        assert_eq!(labels.get("app.kubernetes.io/name"), Some(&"che".to_string()));
        assert_eq!(
            labels.get("app.kubernetes.io/component"),
            Some(&"che-server".to_string())
        );
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&"che-operator".to_string())
        );
    }

    #[test]
    fn test_selector_is_subset_of_labels() {
        let labels = component_labels("postgres");
        for (key, value) in component_selector("postgres") {
            assert_eq!(labels.get(&key), Some(&value));
        }
    }
}
