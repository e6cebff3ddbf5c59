//! DevWorkspace engine integration.
//!
//! When enabled, records the integration configuration the server consumes
//! and reflects the engine state in the CheCluster status. The permissions
//! layer already grants the devworkspace cluster role.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::controller::error::Result;
use crate::deploy::{
    DeployContext, ReconcileFlow, Reconcilable, component_labels, owner_reference,
};
use crate::sync::{delete_object, sync_object};

/// Config map the server reads the integration settings from
pub const DEVWORKSPACE_CONFIG_NAME: &str = "devworkspace-che-config";

pub struct DevWorkspaceReconciler;

#[async_trait]
impl Reconcilable for DevWorkspaceReconciler {
    fn name(&self) -> &'static str {
        "devworkspace"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let enabled = ctx
            .che_cluster
            .spec
            .dev_workspace
            .as_ref()
            .is_some_and(|dw| dw.enable);

        if !enabled {
            delete_object::<ConfigMap>(&ctx.client, &ctx.namespace, DEVWORKSPACE_CONFIG_NAME)
                .await?;
            ctx.che_cluster
                .status
                .get_or_insert_default()
                .dev_workspace_status = "Disabled".to_string();
            return Ok(ReconcileFlow::Done);
        }

        let config = ConfigMap {
            metadata: ObjectMeta {
                name: Some(DEVWORKSPACE_CONFIG_NAME.to_string()),
                namespace: Some(ctx.namespace.clone()),
                labels: Some(component_labels("devworkspace")),
                owner_references: Some(vec![owner_reference(&ctx.che_cluster)]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("CHE_DEVWORKSPACES_ENABLED".to_string(), "true".to_string()),
                (
                    "CHE_INFRA_KUBERNETES_ENABLE__UNSUPPORTED__K8S".to_string(),
                    "true".to_string(),
                ),
            ])),
            ..Default::default()
        };

        let in_sync = sync_object(&ctx.client, &ctx.namespace, config).await?;

        ctx.che_cluster
            .status
            .get_or_insert_default()
            .dev_workspace_status = "Ready".to_string();

        if in_sync {
            Ok(ReconcileFlow::Done)
        } else {
            Ok(ReconcileFlow::Requeue(std::time::Duration::from_secs(1)))
        }
    }
}
