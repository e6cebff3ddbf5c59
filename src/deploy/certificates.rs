//! Merged CA-bundle config map.
//!
//! Users and the platform drop additional trust anchors into the namespace
//! as config maps labeled `component=ca-bundle, part-of=che.eclipse.org`.
//! The operator merges them into one config map mounted by the server. The
//! merged map carries an annotation listing the source revisions so the
//! merge is only redone when a source changes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams};
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::controller::error::Result;
use crate::deploy::{
    CA_BUNDLE_SELECTOR, DeployContext, MERGED_CA_BUNDLE_NAME, ReconcileFlow, Reconcilable,
    component_labels, owner_reference,
};
use crate::sync::sync_object;

/// Annotation listing the merged sources as `name=revision` pairs joined
/// with `.`
pub const INCLUDED_SOURCES_ANNOTATION: &str = "che.eclipse.org/included-configmaps";

/// Render the source-revision annotation for a set of bundles
pub(crate) fn sources_annotation(sources: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = sources
        .iter()
        .map(|(name, revision)| format!("{}={}", name, revision))
        .collect();
    pairs.sort();
    pairs.join(".")
}

/// Merge the data of all source bundles, prefixing keys with the source
/// name so same-named keys cannot clobber each other
pub(crate) fn merge_bundle_data(
    bundles: &[(String, BTreeMap<String, String>)],
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (source, data) in bundles {
        for (key, value) in data {
            merged.insert(format!("{}-{}", source, key), value.clone());
        }
    }
    merged
}

pub struct CertificatesReconciler;

#[async_trait]
impl Reconcilable for CertificatesReconciler {
    fn name(&self) -> &'static str {
        "certificates"
    }

    async fn reconcile(&self, ctx: &mut DeployContext) -> Result<ReconcileFlow> {
        let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

        let sources = config_maps
            .list(&ListParams::default().labels(CA_BUNDLE_SELECTOR))
            .await?;

        let mut revisions = Vec::new();
        let mut bundles = Vec::new();
        for source in &sources {
            let name = source.name_any();
            if name == MERGED_CA_BUNDLE_NAME {
                continue;
            }
            revisions.push((
                name.clone(),
                source.metadata.resource_version.clone().unwrap_or_default(),
            ));
            bundles.push((name, source.data.clone().unwrap_or_default()));
        }

        let annotation = sources_annotation(&revisions);

        // Unchanged sources mean the merged map is already current
        if let Some(existing) = config_maps.get_opt(MERGED_CA_BUNDLE_NAME).await?
            && existing
                .annotations()
                .get(INCLUDED_SOURCES_ANNOTATION)
                .is_some_and(|a| *a == annotation)
        {
            return Ok(ReconcileFlow::Done);
        }

        let merged = ConfigMap {
            metadata: ObjectMeta {
                name: Some(MERGED_CA_BUNDLE_NAME.to_string()),
                namespace: Some(ctx.namespace.clone()),
                labels: Some(component_labels("ca-certs")),
                annotations: Some(BTreeMap::from([(
                    INCLUDED_SOURCES_ANNOTATION.to_string(),
                    annotation,
                )])),
                owner_references: Some(vec![owner_reference(&ctx.che_cluster)]),
                ..Default::default()
            },
            data: Some(merge_bundle_data(&bundles)),
            ..Default::default()
        };

        sync_object(&ctx.client, &ctx.namespace, merged).await?;
        Ok(ReconcileFlow::Done)
    }
}
