//! Create-or-update primitives for cluster objects.
//!
//! Applies a desired object to the cluster with a three-way diff: desired
//! spec vs. live object vs. last-applied content hash. The hash rides on an
//! annotation, so a second operator installation can tell its own objects
//! apart and concurrent operators do not flap each other's resources.

mod compare;

pub use compare::{DiffVerdict, ObjectKind, compare_objects};

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};

/// Annotation carrying the content hash of the last applied spec
pub const HASH_ANNOTATION: &str = "che.eclipse.org/spec-hash";

/// Annotation naming the namespace of the operator that applied the object
pub const NAMESPACE_ANNOTATION: &str = "che.eclipse.org/operator-namespace";

/// Apply a namespaced object; returns `true` when the cluster already holds
/// the desired content.
pub async fn sync_object<K>(client: &Client, ns: &str, desired: K) -> Result<bool>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), ns);
    sync_with_api(&api, ns, desired).await
}

/// Apply a cluster-scoped object. `operator_ns` stamps the namespace
/// annotation so sibling installations leave each other's objects alone.
pub async fn sync_cluster_object<K>(client: &Client, operator_ns: &str, desired: K) -> Result<bool>
where
    K: Resource<Scope = ClusterResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client.clone());
    sync_with_api(&api, operator_ns, desired).await
}

/// Delete a namespaced object, treating not-found as success
pub async fn delete_object<K>(client: &Client, ns: &str, name: &str) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), ns);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete a cluster-scoped object, treating not-found as success
pub async fn delete_cluster_object<K>(client: &Client, name: &str) -> Result<()>
where
    K: Resource<Scope = ClusterResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client.clone());
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn sync_with_api<K>(api: &Api<K>, operator_ns: &str, mut desired: K) -> Result<bool>
where
    K: Resource + Serialize + DeserializeOwned + Clone + std::fmt::Debug,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))?;

    // Hash before stamping the annotations, so the hash never covers itself
    let hash = spec_hash(&desired)?;
    {
        let annotations = desired.meta_mut().annotations.get_or_insert_default();
        annotations.insert(HASH_ANNOTATION.to_string(), hash.clone());
        annotations.insert(NAMESPACE_ANNOTATION.to_string(), operator_ns.to_string());
    }

    let live = match api.get_opt(&name).await? {
        Some(live) => live,
        None => {
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    debug!(kind = %kind, name = %name, "Created object");
                    return Ok(false);
                }
                // The informer cache was stale; retry as an update
                Err(kube::Error::Api(ae)) if ae.code == 409 => api.get(&name).await?,
                Err(kube::Error::Api(ae)) if ae.code == 422 || ae.code == 403 => {
                    return Err(Error::PermanentError(format!(
                        "cannot create {} {}: {}",
                        kind, name, ae.message
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let live_annotations = live.meta().annotations.clone().unwrap_or_default();

    if live_annotations.get(HASH_ANNOTATION) == Some(&hash) {
        return Ok(true);
    }

    if let Some(owner_ns) = live_annotations.get(NAMESPACE_ANNOTATION)
        && owner_ns != operator_ns
    {
        warn!(
            kind = %kind,
            name = %name,
            owner = %owner_ns,
            "Object is managed by an operator in another namespace, leaving it alone"
        );
        return Ok(true);
    }

    let desired_json = serde_json::to_value(&desired)?;
    let live_json = serde_json::to_value(&live)?;

    match compare_objects(&kind, &desired_json, &live_json) {
        DiffVerdict::Same => {
            // Content agrees but the stored hash is stale (e.g. written by an
            // older operator build); refresh it so the next pass short-circuits
            let patch = json!({
                "metadata": {
                    "annotations": {
                        HASH_ANNOTATION: hash,
                        NAMESPACE_ANNOTATION: operator_ns,
                    }
                }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        DiffVerdict::Differs => {
            desired.meta_mut().resource_version = live.meta().resource_version.clone();
            match api.replace(&name, &PostParams::default(), &desired).await {
                Ok(_) => {
                    debug!(kind = %kind, name = %name, "Updated object");
                    Ok(false)
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::ConflictError(format!(
                    "{} {}",
                    kind, name
                ))),
                Err(kube::Error::Api(ae)) if ae.code == 422 || ae.code == 403 => {
                    Err(Error::PermanentError(format!(
                        "cannot update {} {}: {}",
                        kind, name, ae.message
                    )))
                }
                Err(e) => Err(e.into()),
            }
        }
        DiffVerdict::MetadataOnly => {
            let patch = json!({
                "metadata": {
                    "labels": desired.meta().labels,
                    "annotations": desired.meta().annotations,
                    "ownerReferences": desired.meta().owner_references,
                }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(false)
        }
        DiffVerdict::UnmanagedDivergence => {
            warn!(
                kind = %kind,
                name = %name,
                "Object of unregistered kind diverges beyond metadata, not updating"
            );
            Ok(true)
        }
    }
}

/// Content hash of an object, metadata and status excluded
pub fn spec_hash<K: Serialize>(object: &K) -> Result<String> {
    let mut value = serde_json::to_value(object)?;
    if let serde_json::Value::Object(ref mut map) = value {
        map.remove("metadata");
        map.remove("status");
    }
    let canonical = serde_json::to_vec(&value)?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("{:x}", digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("che".to_string()),
                namespace: Some("eclipse-che".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_stable_across_metadata_changes() {
        let a = config_map(&[("CHE_HOST", "che.example.com")]);
        let mut b = a.clone();
        b.metadata.labels = Some(BTreeMap::from([("app".to_string(), "che".to_string())]));
        b.metadata.resource_version = Some("12345".to_string());
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = config_map(&[("CHE_HOST", "che.example.com")]);
        let b = config_map(&[("CHE_HOST", "other.example.com")]);
        assert_ne!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
    }
}
