//! Cluster-scoped permissions for the `che` service account.
//!
//! Maintains three operator-defined cluster roles with a namespace-scoped
//! name prefix plus their bindings, and one binding per user-supplied
//! cluster role listed in the CR. Cluster-scoped objects cannot be owned by
//! a namespaced CR, so each user-supplied binding is tracked with its own
//! finalizer on the CR and removed when the role disappears from the spec.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use tracing::info;

use crate::controller::error::Result;
use crate::crd::CheCluster;
use crate::deploy::{
    CHE_SERVICE_ACCOUNT, DeployContext, ReconcileFlow, Reconcilable, component_labels,
    owner_reference,
};
use crate::sync::{delete_cluster_object, sync_cluster_object, sync_object};

/// Suffix of the per-role finalizers tracked on the CR
pub const CRB_FINALIZER_SUFFIX: &str = ".crb.finalizers.che.eclipse.org";

/// Kubernetes caps finalizer name segments at 63 characters
const MAX_FINALIZER_LENGTH: usize = 63;

/// Finalizer string for a user-supplied cluster role, truncated to the
/// Kubernetes limit
pub fn crb_finalizer_name(role: &str) -> String {
    let finalizer = format!("{}{}", role, CRB_FINALIZER_SUFFIX);
    if finalizer.len() <= MAX_FINALIZER_LENGTH {
        finalizer
    } else {
        finalizer[..MAX_FINALIZER_LENGTH].to_string()
    }
}

/// Name of the binding for a user-supplied cluster role
fn user_crb_name(namespace: &str, role: &str) -> String {
    format!("{}-{}", namespace, role)
}

/// The three operator-defined cluster roles, `(suffix, rules)`
fn operator_cluster_roles() -> Vec<(&'static str, Vec<PolicyRule>)> {
    vec![
        (
            "cheworkspaces-clusterrole",
            vec![
                PolicyRule {
                    api_groups: Some(vec!["".to_string()]),
                    resources: Some(vec![
                        "pods".to_string(),
                        "pods/exec".to_string(),
                        "pods/log".to_string(),
                        "services".to_string(),
                        "configmaps".to_string(),
                        "secrets".to_string(),
                        "persistentvolumeclaims".to_string(),
                    ]),
                    verbs: vec!["get", "list", "watch", "create", "update", "patch", "delete"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["apps".to_string()]),
                    resources: Some(vec!["deployments".to_string(), "replicasets".to_string()]),
                    verbs: vec!["get", "list", "watch", "create", "update", "patch", "delete"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    ..Default::default()
                },
            ],
        ),
        (
            "cheworkspaces-namespaces-clusterrole",
            vec![PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["namespaces".to_string()]),
                verbs: vec!["get", "list", "watch", "create"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                ..Default::default()
            }],
        ),
        (
            "cheworkspaces-devworkspace-clusterrole",
            vec![PolicyRule {
                api_groups: Some(vec!["workspace.devfile.io".to_string()]),
                resources: Some(vec!["devworkspaces".to_string(), "devworkspacetemplates".to_string()]),
                verbs: vec!["get", "list", "watch", "create", "update", "patch", "delete"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                ..Default::default()
            }],
        ),
    ]
}

pub struct PermissionsReconciler;

#[async_trait]
impl Reconcilable for PermissionsReconciler {
    fn name(&self) -> &'static str {
        "permissions"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let mut in_sync = true;

        in_sync &= ensure_service_account(ctx).await?;

        for (suffix, rules) in operator_cluster_roles() {
            let role_name = format!("{}-{}", ctx.namespace, suffix);
            in_sync &= sync_cluster_object(
                &ctx.client,
                &ctx.namespace,
                cluster_role(&role_name, rules),
            )
            .await?;
            in_sync &= sync_cluster_object(
                &ctx.client,
                &ctx.namespace,
                cluster_role_binding(&role_name, &role_name, &ctx.namespace),
            )
            .await?;
        }

        in_sync &= reconcile_user_cluster_roles(ctx).await?;

        if in_sync {
            Ok(ReconcileFlow::Done)
        } else {
            Ok(ReconcileFlow::Requeue(std::time::Duration::from_secs(1)))
        }
    }

    async fn finalize(&self, ctx: &DeployContext) -> Result<bool> {
        for (suffix, _) in operator_cluster_roles() {
            let role_name = format!("{}-{}", ctx.namespace, suffix);
            delete_cluster_object::<ClusterRoleBinding>(&ctx.client, &role_name).await?;
            delete_cluster_object::<ClusterRole>(&ctx.client, &role_name).await?;
        }

        // Remove every user-supplied binding still tracked by a finalizer
        let tracked: Vec<String> = ctx
            .che_cluster
            .finalizers()
            .iter()
            .filter(|f| f.ends_with(CRB_FINALIZER_SUFFIX) || f.contains(".crb.finalizers."))
            .cloned()
            .collect();

        for role in &ctx.che_cluster.spec.server.che_cluster_roles {
            delete_cluster_object::<ClusterRoleBinding>(
                &ctx.client,
                &user_crb_name(&ctx.namespace, role),
            )
            .await?;
        }

        if !tracked.is_empty() {
            remove_finalizers(ctx, &tracked).await?;
        }

        Ok(true)
    }
}

/// Ensure the `che` service account exists
async fn ensure_service_account(ctx: &DeployContext) -> Result<bool> {
    let service_account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(CHE_SERVICE_ACCOUNT.to_string()),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(component_labels("che-server")),
            owner_references: Some(vec![owner_reference(&ctx.che_cluster)]),
            ..Default::default()
        },
        ..Default::default()
    };
    sync_object(&ctx.client, &ctx.namespace, service_account).await
}

/// Bindings for user-supplied cluster roles, tracked with per-role
/// finalizers on the CR
async fn reconcile_user_cluster_roles(ctx: &mut DeployContext) -> Result<bool> {
    let mut in_sync = true;
    let desired_roles = ctx.che_cluster.spec.server.che_cluster_roles.clone();

    let mut finalizers: Vec<String> = ctx.che_cluster.finalizers().to_vec();
    let mut finalizers_changed = false;

    for role in &desired_roles {
        in_sync &= sync_cluster_object(
            &ctx.client,
            &ctx.namespace,
            cluster_role_binding(&user_crb_name(&ctx.namespace, role), role, &ctx.namespace),
        )
        .await?;

        let finalizer = crb_finalizer_name(role);
        if !finalizers.contains(&finalizer) {
            finalizers.push(finalizer);
            finalizers_changed = true;
        }
    }

    // A role removed from the spec leaves a finalizer behind; delete its
    // binding and drop the finalizer
    let desired_finalizers: Vec<String> =
        desired_roles.iter().map(|r| crb_finalizer_name(r)).collect();
    let stale: Vec<String> = finalizers
        .iter()
        .filter(|f| f.contains(".crb.finalizers.") && !desired_finalizers.contains(f))
        .cloned()
        .collect();

    for finalizer in &stale {
        if let Some(role) = finalizer.split(".crb.finalizers.").next() {
            delete_cluster_object::<ClusterRoleBinding>(
                &ctx.client,
                &user_crb_name(&ctx.namespace, role),
            )
            .await?;
            info!(role = %role, "Removed cluster role binding for unlisted role");
        }
        finalizers.retain(|f| f != finalizer);
        finalizers_changed = true;
    }

    if finalizers_changed {
        let api: Api<CheCluster> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
        let patch = json!({ "metadata": { "finalizers": &finalizers } });
        api.patch(
            &ctx.cluster_name(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        ctx.che_cluster.metadata.finalizers = Some(finalizers);
        in_sync = false;
    }

    Ok(in_sync)
}

/// Drop the given finalizers from the CR
async fn remove_finalizers(ctx: &DeployContext, to_remove: &[String]) -> Result<()> {
    let remaining: Vec<String> = ctx
        .che_cluster
        .finalizers()
        .iter()
        .filter(|f| !to_remove.contains(f))
        .cloned()
        .collect();

    let api: Api<CheCluster> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let patch = json!({ "metadata": { "finalizers": remaining } });
    api.patch(
        &ctx.cluster_name(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

fn cluster_role(name: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(component_labels("che-server")),
            ..Default::default()
        },
        rules: Some(rules),
        ..Default::default()
    }
}

fn cluster_role_binding(name: &str, role_name: &str, namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(component_labels("che-server")),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: CHE_SERVICE_ACCOUNT.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_name() {
        assert_eq!(
            crb_finalizer_name("my-extra-role"),
            "my-extra-role.crb.finalizers.che.eclipse.org"
        );
    }

    #[test]
    fn test_finalizer_truncated_to_63_chars() {
        let long_role = "a".repeat(80);
        let finalizer = crb_finalizer_name(&long_role);
        assert_eq!(finalizer.len(), 63);
        assert!(finalizer.starts_with("aaaa"));
    }

    #[test]
    fn test_operator_roles_have_namespace_prefix() {
        for (suffix, rules) in operator_cluster_roles() {
            assert!(!rules.is_empty());
            let name = format!("{}-{}", "eclipse-che", suffix);
            assert!(name.starts_with("eclipse-che-"));
        }
    }

    #[test]
    fn test_binding_targets_che_service_account() {
        let binding = cluster_role_binding("eclipse-che-role", "role", "eclipse-che");
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects[0].name, CHE_SERVICE_ACCOUNT);
        assert_eq!(subjects[0].namespace.as_deref(), Some("eclipse-che"));
        assert_eq!(binding.role_ref.kind, "ClusterRole");
    }
}
