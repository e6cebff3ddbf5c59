//! Per-kind object comparers for the sync primitives.
//!
//! Live objects carry fields filled in by the API server and by admission
//! controllers (cluster IPs, termination message paths, projected service
//! account volumes). Comparing a desired object against a live one without
//! filtering those fields would make every pass look like a divergence and
//! the operator would fight the defaulting controllers forever.
//!
//! Kinds are registered in an explicit enum; each entry names the JSON paths
//! to drop from both sides before comparing. Kinds not in the registry fall
//! back to a conservative metadata-only comparison.

use serde_json::Value;

/// Registered kinds with a dedicated field filter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Deployment,
    Service,
    ConfigMap,
    Secret,
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Ingress,
}

impl ObjectKind {
    /// Resolve a kind string (`K::kind(&())`) to a registry entry
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(Self::Deployment),
            "Service" => Some(Self::Service),
            "ConfigMap" => Some(Self::ConfigMap),
            "Secret" => Some(Self::Secret),
            "ServiceAccount" => Some(Self::ServiceAccount),
            "Role" => Some(Self::Role),
            "RoleBinding" => Some(Self::RoleBinding),
            "ClusterRole" => Some(Self::ClusterRole),
            "ClusterRoleBinding" => Some(Self::ClusterRoleBinding),
            "Ingress" => Some(Self::Ingress),
            _ => None,
        }
    }

    /// JSON paths removed from both sides before comparison. A `*` segment
    /// matches every element of an array.
    fn ignored_paths(&self) -> &'static [&'static str] {
        match self {
            ObjectKind::Deployment => &[
                "/spec/revisionHistoryLimit",
                "/spec/progressDeadlineSeconds",
                "/spec/strategy",
                "/spec/template/metadata/creationTimestamp",
                "/spec/template/spec/dnsPolicy",
                "/spec/template/spec/restartPolicy",
                "/spec/template/spec/schedulerName",
                "/spec/template/spec/terminationGracePeriodSeconds",
                "/spec/template/spec/serviceAccount",
                "/spec/template/spec/deprecatedServiceAccount",
                "/spec/template/spec/containers/*/terminationMessagePath",
                "/spec/template/spec/containers/*/terminationMessagePolicy",
                "/spec/template/spec/containers/*/imagePullPolicy",
            ],
            ObjectKind::Service => &[
                "/spec/clusterIP",
                "/spec/clusterIPs",
                "/spec/ipFamilies",
                "/spec/ipFamilyPolicy",
                "/spec/internalTrafficPolicy",
                "/spec/sessionAffinity",
                "/spec/ports/*/protocol",
            ],
            ObjectKind::ServiceAccount => &["/secrets", "/imagePullSecrets"],
            ObjectKind::ConfigMap
            | ObjectKind::Secret
            | ObjectKind::Role
            | ObjectKind::RoleBinding
            | ObjectKind::ClusterRole
            | ObjectKind::ClusterRoleBinding
            | ObjectKind::Ingress => &[],
        }
    }
}

/// Verdict of a comparison
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffVerdict {
    /// Objects agree on every field the operator manages
    Same,
    /// Objects diverge; the live one must be updated
    Differs,
    /// Unregistered kind: labels/annotations/owner refs diverge and must be
    /// synced; the rest of the object is left alone
    MetadataOnly,
    /// Unregistered kind diverging beyond labels/annotations/owner refs;
    /// the sync primitive warns instead of updating
    UnmanagedDivergence,
}

/// Compare a desired object against the live one.
///
/// Both arguments are the JSON representation of the full object. The hash
/// annotation check in the sync primitive runs first, so this is only called
/// when the stored hash no longer matches.
pub fn compare_objects(kind: &str, desired: &Value, live: &Value) -> DiffVerdict {
    match ObjectKind::from_kind(kind) {
        // Secrets live-side carry base64 `data` while the desired side uses
        // `stringData`; field equality is meaningless, the hash mismatch
        // already proved divergence
        Some(ObjectKind::Secret) => DiffVerdict::Differs,
        Some(object_kind) => {
            let desired = normalize(object_kind, desired);
            let live = normalize(object_kind, live);
            if desired == live {
                DiffVerdict::Same
            } else {
                DiffVerdict::Differs
            }
        }
        None => {
            if meta_subset(desired) != meta_subset(live) {
                DiffVerdict::MetadataOnly
            } else if body_subset(desired) != body_subset(live) {
                DiffVerdict::UnmanagedDivergence
            } else {
                DiffVerdict::Same
            }
        }
    }
}

/// Everything but metadata and status, used to spot unmanaged divergence on
/// unregistered kinds
fn body_subset(object: &Value) -> Value {
    let mut body = object.clone();
    if let Value::Object(ref mut map) = body {
        map.remove("metadata");
        map.remove("status");
    }
    body
}

fn normalize(kind: ObjectKind, object: &Value) -> Value {
    let mut normalized = object.clone();

    if let Value::Object(ref mut map) = normalized {
        map.remove("status");
        if let Some(meta) = map.remove("metadata") {
            map.insert("metadata".to_string(), reduce_metadata(&meta));
        }
    }

    for path in kind.ignored_paths() {
        remove_path(&mut normalized, &segments(path));
    }

    if kind == ObjectKind::Deployment {
        strip_projected_api_access(&mut normalized);
    }

    normalized
}

/// Only the metadata the operator manages: labels, non-system annotations
/// and owner references. The sync layer's own bookkeeping annotations are
/// managed separately and never count as divergence.
fn reduce_metadata(meta: &Value) -> Value {
    let mut reduced = serde_json::Map::new();
    if let Some(labels) = meta.get("labels") {
        reduced.insert("labels".to_string(), labels.clone());
    }
    if let Some(Value::Object(annotations)) = meta.get("annotations") {
        let kept: serde_json::Map<String, Value> = annotations
            .iter()
            .filter(|(k, _)| {
                !k.starts_with("kubectl.kubernetes.io/")
                    && !k.starts_with("deployment.kubernetes.io/")
                    && k.as_str() != super::HASH_ANNOTATION
                    && k.as_str() != super::NAMESPACE_ANNOTATION
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !kept.is_empty() {
            reduced.insert("annotations".to_string(), Value::Object(kept));
        }
    }
    if let Some(owners) = meta.get("ownerReferences") {
        reduced.insert("ownerReferences".to_string(), owners.clone());
    }
    Value::Object(reduced)
}

fn meta_subset(object: &Value) -> Value {
    object
        .get("metadata")
        .map(reduce_metadata)
        .unwrap_or(Value::Null)
}

fn segments(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').collect()
}

/// Remove a path from a JSON value, `*` matching every array element
fn remove_path(value: &mut Value, path: &[&str]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };

    if *head == "*" {
        if let Value::Array(items) = value {
            for item in items {
                remove_path(item, rest);
            }
        }
        return;
    }

    match value {
        Value::Object(map) => {
            if rest.is_empty() {
                map.remove(*head);
            } else if let Some(child) = map.get_mut(*head) {
                remove_path(child, rest);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>()
                && let Some(child) = items.get_mut(index)
            {
                remove_path(child, rest);
            }
        }
        _ => {}
    }
}

/// The kubelet injects a projected `kube-api-access-*` volume and mount into
/// every pod; drop them from both sides
fn strip_projected_api_access(deployment: &mut Value) {
    let Some(pod_spec) = deployment.pointer_mut("/spec/template/spec") else {
        return;
    };

    if let Some(Value::Array(volumes)) = pod_spec.get_mut("volumes") {
        volumes.retain(|v| {
            v.get("name")
                .and_then(Value::as_str)
                .is_none_or(|name| !name.starts_with("kube-api-access-"))
        });
    }

    if let Some(Value::Array(containers)) = pod_spec.get_mut("containers") {
        for container in containers {
            if let Some(Value::Array(mounts)) = container.get_mut("volumeMounts") {
                mounts.retain(|m| {
                    m.get("name")
                        .and_then(Value::as_str)
                        .is_none_or(|name| !name.starts_with("kube-api-access-"))
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_cluster_ip_ignored() {
        let desired = json!({
            "metadata": {"name": "che-host", "labels": {"app": "che"}},
            "spec": {"ports": [{"port": 8080}], "selector": {"app": "che"}}
        });
        let live = json!({
            "metadata": {"name": "che-host", "labels": {"app": "che"}},
            "spec": {
                "ports": [{"port": 8080, "protocol": "TCP"}],
                "selector": {"app": "che"},
                "clusterIP": "10.96.0.17",
                "clusterIPs": ["10.96.0.17"],
                "sessionAffinity": "None"
            },
            "status": {"loadBalancer": {}}
        });
        assert_eq!(compare_objects("Service", &desired, &live), DiffVerdict::Same);
    }

    #[test]
    fn test_service_port_change_detected() {
        let desired = json!({
            "metadata": {"name": "che-host"},
            "spec": {"ports": [{"port": 8443}]}
        });
        let live = json!({
            "metadata": {"name": "che-host"},
            "spec": {"ports": [{"port": 8080}], "clusterIP": "10.96.0.17"}
        });
        assert_eq!(
            compare_objects("Service", &desired, &live),
            DiffVerdict::Differs
        );
    }

    #[test]
    fn test_deployment_defaulted_fields_ignored() {
        let desired = json!({
            "metadata": {"name": "che"},
            "spec": {
                "template": {"spec": {"containers": [{"name": "che", "image": "che:1"}]}}
            }
        });
        let live = json!({
            "metadata": {"name": "che"},
            "spec": {
                "revisionHistoryLimit": 10,
                "progressDeadlineSeconds": 600,
                "strategy": {"type": "RollingUpdate"},
                "template": {"spec": {
                    "dnsPolicy": "ClusterFirst",
                    "restartPolicy": "Always",
                    "containers": [{
                        "name": "che",
                        "image": "che:1",
                        "terminationMessagePath": "/dev/termination-log",
                        "terminationMessagePolicy": "File",
                        "volumeMounts": [{"name": "kube-api-access-x7k2", "mountPath": "/var/run/secrets"}]
                    }],
                    "volumes": [{"name": "kube-api-access-x7k2", "projected": {}}]
                }}
            }
        });
        assert_eq!(
            compare_objects("Deployment", &desired, &live),
            DiffVerdict::Same
        );
    }

    #[test]
    fn test_deployment_image_change_detected() {
        let desired = json!({
            "metadata": {"name": "che"},
            "spec": {"template": {"spec": {"containers": [{"name": "che", "image": "che:2"}]}}}
        });
        let live = json!({
            "metadata": {"name": "che"},
            "spec": {"template": {"spec": {"containers": [{"name": "che", "image": "che:1"}]}}}
        });
        assert_eq!(
            compare_objects("Deployment", &desired, &live),
            DiffVerdict::Differs
        );
    }

    #[test]
    fn test_secret_always_differs_on_hash_mismatch() {
        let a = json!({"metadata": {"name": "s"}, "stringData": {"password": "new"}});
        let b = json!({"metadata": {"name": "s"}, "data": {"password": "b2xk"}});
        assert_eq!(compare_objects("Secret", &a, &b), DiffVerdict::Differs);
    }

    #[test]
    fn test_unknown_kind_conservative() {
        let desired = json!({
            "metadata": {"name": "pvc", "labels": {"app": "che"}},
            "spec": {"resources": {"requests": {"storage": "10Gi"}}}
        });
        let mut live = desired.clone();
        live["spec"]["resources"]["requests"]["storage"] = json!("20Gi");
        // Spec divergence on an unregistered kind is surfaced, not updated
        assert_eq!(
            compare_objects("PersistentVolumeClaim", &desired, &live),
            DiffVerdict::UnmanagedDivergence
        );

        live["spec"]["resources"]["requests"]["storage"] = json!("10Gi");
        live["metadata"]["labels"]["app"] = json!("other");
        assert_eq!(
            compare_objects("PersistentVolumeClaim", &desired, &live),
            DiffVerdict::MetadataOnly
        );
    }
}
