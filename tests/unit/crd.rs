//! CRD serialization and defaulting tests

use che_operator::crd::{
    BackupServerType, BackupState, CheCluster, CheClusterBackup, CheClusterBackupSpec,
    CheClusterSpec, ChePhase, RestServerConfig, RestoreStage,
};
use kube::core::ObjectMeta;

#[test]
fn test_che_cluster_round_trip() {
    let mut spec = CheClusterSpec::default();
    spec.server.che_host = "che.example.com".to_string();
    spec.server.tls_support = true;
    spec.database.external_db = false;
    spec.k8s.ingress_domain = "apps.example.com".to_string();

    let cluster = CheCluster {
        metadata: ObjectMeta {
            name: Some("eclipse-che".to_string()),
            namespace: Some("che".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    };

    let json = serde_json::to_value(&cluster).unwrap();
    assert_eq!(json["spec"]["server"]["cheHost"], "che.example.com");
    assert_eq!(json["spec"]["server"]["tlsSupport"], true);
    assert_eq!(json["spec"]["k8s"]["ingressDomain"], "apps.example.com");

    let parsed: CheCluster = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.spec.server.che_host, "che.example.com");
    assert!(parsed.spec.server.tls_support);
}

#[test]
fn test_minimal_manifest_parses_with_defaults() {
    let yaml = r#"
apiVersion: org.eclipse.che/v1
kind: CheCluster
metadata:
  name: eclipse-che
spec: {}
"#;
    let cluster: CheCluster = serde_yaml::from_str(yaml).unwrap();
    assert!(!cluster.spec.server.tls_support);
    assert!(!cluster.spec.database.external_db);
    assert!(cluster.spec.server.che_cluster_roles.is_empty());
    assert!(cluster.spec.dev_workspace.is_none());
}

#[test]
fn test_phase_serialization() {
    assert_eq!(
        serde_json::to_string(&ChePhase::Active).unwrap(),
        "\"Active\""
    );
    assert_eq!(
        serde_json::to_string(&ChePhase::RollingUpdate).unwrap(),
        "\"RollingUpdate\""
    );
    // The unset phase serializes to an empty string, matching a fresh CR
    assert_eq!(serde_json::to_string(&ChePhase::Unknown).unwrap(), "\"\"");
}

#[test]
fn test_backup_state_default_is_pending() {
    assert_eq!(BackupState::default(), BackupState::Pending);
    assert_eq!(RestoreStage::default(), RestoreStage::Idle);
}

#[test]
fn test_backup_spec_round_trip() {
    let spec = CheClusterBackupSpec {
        use_internal_backup_server: true,
        trigger_now: true,
        servers: Default::default(),
        server_type: Some(BackupServerType::AwsS3),
    };
    let json = serde_json::to_value(&spec).unwrap();
    assert_eq!(json["useInternalBackupServer"], true);
    assert_eq!(json["triggerNow"], true);
    assert_eq!(json["serverType"], "awss3");

    let parsed: CheClusterBackupSpec = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.server_type, Some(BackupServerType::AwsS3));
}

#[test]
fn test_rest_config_repo_password_flattened() {
    let yaml = r#"
hostname: backup.example.com
port: "8000"
repoPassword: secret-password
"#;
    let config: RestServerConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.hostname, "backup.example.com");
    assert_eq!(config.repo_password.repo_password, "secret-password");
}

#[test]
fn test_backup_cr_with_status() {
    let yaml = r#"
apiVersion: org.eclipse.che/v1
kind: CheClusterBackup
metadata:
  name: backup
  namespace: che
spec:
  triggerNow: false
status:
  state: Succeeded
  snapshotId: 0bda98f0
  message: Backup successfully finished
"#;
    let backup: CheClusterBackup = serde_yaml::from_str(yaml).unwrap();
    let status = backup.status.unwrap();
    assert_eq!(status.state, BackupState::Succeeded);
    assert_eq!(status.snapshot_id, "0bda98f0");
}

#[test]
fn test_crd_kinds_and_group() {
    use kube::Resource;
    assert_eq!(CheCluster::kind(&()), "CheCluster");
    assert_eq!(CheCluster::group(&()), "org.eclipse.che");
    assert_eq!(CheCluster::version(&()), "v1");
    assert_eq!(CheClusterBackup::kind(&()), "CheClusterBackup");
}
