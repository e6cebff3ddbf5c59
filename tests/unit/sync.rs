//! Sync comparer and content hash tests

use che_operator::sync::{DiffVerdict, ObjectKind, compare_objects, spec_hash};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ObjectMeta;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

#[test]
fn test_registry_resolves_known_kinds() {
    for kind in [
        "Deployment",
        "Service",
        "ConfigMap",
        "Secret",
        "ServiceAccount",
        "ClusterRole",
        "ClusterRoleBinding",
        "Ingress",
    ] {
        assert!(ObjectKind::from_kind(kind).is_some(), "{} not registered", kind);
    }
    assert!(ObjectKind::from_kind("PersistentVolumeClaim").is_none());
    assert!(ObjectKind::from_kind("Route").is_none());
}

#[test]
fn test_live_defaults_do_not_cause_divergence() {
    let desired = json!({
        "metadata": {"name": "che", "labels": {"app": "che"}},
        "spec": {
            "replicas": 1,
            "template": {"spec": {"containers": [{"name": "che", "image": "che:7.30"}]}}
        }
    });
    let live = json!({
        "metadata": {
            "name": "che",
            "labels": {"app": "che"},
            "annotations": {"deployment.kubernetes.io/revision": "3"},
            "resourceVersion": "4242",
            "uid": "bb2c"
        },
        "spec": {
            "replicas": 1,
            "revisionHistoryLimit": 10,
            "strategy": {"type": "RollingUpdate"},
            "template": {"spec": {
                "restartPolicy": "Always",
                "containers": [{
                    "name": "che",
                    "image": "che:7.30",
                    "imagePullPolicy": "Always",
                    "terminationMessagePath": "/dev/termination-log"
                }]
            }}
        },
        "status": {"availableReplicas": 1}
    });
    assert_eq!(
        compare_objects("Deployment", &desired, &live),
        DiffVerdict::Same
    );
}

#[test]
fn test_replica_change_is_divergence() {
    let desired = json!({"metadata": {"name": "che"}, "spec": {"replicas": 2}});
    let live = json!({"metadata": {"name": "che"}, "spec": {"replicas": 1}});
    assert_eq!(
        compare_objects("Deployment", &desired, &live),
        DiffVerdict::Differs
    );
}

#[test]
fn test_unknown_kind_metadata_sync_only() {
    let desired = json!({
        "metadata": {"name": "data", "labels": {"app": "che"}},
        "spec": {"volumeName": "pv-1"}
    });
    let live = json!({
        "metadata": {"name": "data", "labels": {}},
        "spec": {"volumeName": "pv-1"}
    });
    assert_eq!(
        compare_objects("PersistentVolumeClaim", &desired, &live),
        DiffVerdict::MetadataOnly
    );
}

fn config_map(data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("che".to_string()),
            namespace: Some("eclipse-che".to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[test]
fn test_hash_is_hex_and_stable() {
    let cm = config_map(BTreeMap::from([(
        "CHE_HOST".to_string(),
        "che.example.com".to_string(),
    )]));
    let a = spec_hash(&cm).unwrap();
    let b = spec_hash(&cm).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

proptest! {
    /// Metadata never influences the content hash
    #[test]
    fn hash_ignores_metadata(
        key in "[A-Z_]{1,12}",
        value in "[a-z0-9.]{0,24}",
        label in "[a-z]{1,8}"
    ) {
        let data = BTreeMap::from([(key, value)]);
        let plain = config_map(data.clone());
        let mut labeled = config_map(data);
        labeled.metadata.labels = Some(BTreeMap::from([("app".to_string(), label)]));
        labeled.metadata.resource_version = Some("99".to_string());
        prop_assert_eq!(spec_hash(&plain).unwrap(), spec_hash(&labeled).unwrap());
    }

    /// Different data means a different hash
    #[test]
    fn hash_tracks_content(value_a in "[a-z]{1,16}", value_b in "[a-z]{1,16}") {
        prop_assume!(value_a != value_b);
        let a = config_map(BTreeMap::from([("KEY".to_string(), value_a)]));
        let b = config_map(BTreeMap::from([("KEY".to_string(), value_b)]));
        prop_assert_ne!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
    }
}
