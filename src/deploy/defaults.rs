//! Fills unset CheCluster spec fields and generates the persisted secrets
//! on first run.
//!
//! Defaults are written back to the CR so the user sees the effective
//! configuration; generated passwords live in secrets owned by the CR and
//! are never regenerated once present.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use rand::Rng;
use serde_json::json;
use tracing::info;

use crate::controller::error::Result;
use crate::crd::CheCluster;
use crate::deploy::{
    DeployContext, IDENTITY_PROVIDER_SECRET, POSTGRES_CREDENTIALS_SECRET, POSTGRES_SERVICE_NAME,
    ReconcileFlow, Reconcilable, component_labels, owner_reference,
};

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Fill unset fields in place; returns whether anything changed
pub fn apply_defaults(cluster: &mut CheCluster) -> bool {
    let mut changed = false;

    let mut default_field = |field: &mut String, value: &str| {
        if field.is_empty() {
            *field = value.to_string();
            changed = true;
        }
    };

    default_field(&mut cluster.spec.server.che_log_level, "INFO");
    default_field(&mut cluster.spec.storage.pvc_strategy, "common");
    default_field(&mut cluster.spec.storage.pvc_claim_size, "10Gi");

    if !cluster.spec.database.external_db {
        default_field(
            &mut cluster.spec.database.che_postgres_hostname,
            POSTGRES_SERVICE_NAME,
        );
        default_field(&mut cluster.spec.database.che_postgres_port, "5432");
        default_field(&mut cluster.spec.database.che_postgres_db, "dbche");
        default_field(
            &mut cluster.spec.database.che_postgres_secret,
            POSTGRES_CREDENTIALS_SECRET,
        );
    }

    if !cluster.spec.auth.external_identity_provider {
        default_field(&mut cluster.spec.auth.identity_provider_realm, "che");
        default_field(
            &mut cluster.spec.auth.identity_provider_client_id,
            "che-public",
        );
        default_field(
            &mut cluster.spec.auth.identity_provider_secret,
            IDENTITY_PROVIDER_SECRET,
        );
    }

    changed
}

pub struct DefaultsReconciler;

#[async_trait]
impl Reconcilable for DefaultsReconciler {
    fn name(&self) -> &'static str {
        "defaults"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        if apply_defaults(&mut ctx.che_cluster) {
            let api: Api<CheCluster> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
            let patch = json!({ "spec": &ctx.che_cluster.spec });
            api.patch(
                &ctx.cluster_name(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
            info!("Defaulted unset CheCluster spec fields");
        }

        if !ctx.che_cluster.spec.database.external_db {
            ensure_credentials_secret(
                ctx,
                POSTGRES_CREDENTIALS_SECRET,
                "postgres",
                &[("user", "pgche".to_string()), ("password", generate_password(32))],
            )
            .await?;
        }

        if !ctx.che_cluster.spec.auth.external_identity_provider {
            ensure_credentials_secret(
                ctx,
                IDENTITY_PROVIDER_SECRET,
                "keycloak",
                &[("user", "admin".to_string()), ("password", generate_password(32))],
            )
            .await?;
        }

        Ok(ReconcileFlow::Done)
    }
}

/// Create a credentials secret once; existing secrets are never rewritten,
/// the generated password must survive operator restarts
async fn ensure_credentials_secret(
    ctx: &DeployContext,
    name: &str,
    component: &str,
    entries: &[(&str, String)],
) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    if secrets.get_opt(name).await?.is_some() {
        return Ok(());
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(component_labels(component)),
            owner_references: Some(vec![owner_reference(&ctx.che_cluster)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    };

    match secrets.create(&Default::default(), &secret).await {
        Ok(_) => {
            info!(secret = %name, "Generated credentials secret");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
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
    fn test_defaults_fill_unset_fields() {
        let mut c = cluster(CheClusterSpec::default());
        assert!(apply_defaults(&mut c));
        assert_eq!(c.spec.server.che_log_level, "INFO");
        assert_eq!(c.spec.storage.pvc_strategy, "common");
        assert_eq!(c.spec.database.che_postgres_hostname, POSTGRES_SERVICE_NAME);
        assert_eq!(c.spec.database.che_postgres_db, "dbche");
        assert_eq!(c.spec.auth.identity_provider_realm, "che");
    }

    #[test]
    fn test_defaults_idempotent() {
        let mut c = cluster(CheClusterSpec::default());
        assert!(apply_defaults(&mut c));
        assert!(!apply_defaults(&mut c));
    }

    #[test]
    fn test_defaults_keep_user_values() {
        let mut spec = CheClusterSpec::default();
        spec.server.che_log_level = "DEBUG".to_string();
        spec.database.che_postgres_db = "customdb".to_string();
        let mut c = cluster(spec);
        apply_defaults(&mut c);
        assert_eq!(c.spec.server.che_log_level, "DEBUG");
        assert_eq!(c.spec.database.che_postgres_db, "customdb");
    }

    #[test]
    fn test_external_db_not_defaulted() {
        let mut spec = CheClusterSpec::default();
        spec.database.external_db = true;
        let mut c = cluster(spec);
        apply_defaults(&mut c);
        assert!(c.spec.database.che_postgres_hostname.is_empty());
        assert!(c.spec.database.che_postgres_secret.is_empty());
    }
}
