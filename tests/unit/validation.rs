//! CheCluster validation tests against both cluster flavors

use che_operator::controller::validate_che_cluster;
use che_operator::crd::{CheCluster, CheClusterSpec};
use che_operator::deploy::defaults::apply_defaults;
use che_operator::platform::Infrastructure;
use kube::core::ObjectMeta;

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
fn test_defaulted_spec_is_valid() {
    let mut c = cluster(CheClusterSpec::default());
    c.spec.k8s.ingress_domain = "apps.example.com".to_string();
    apply_defaults(&mut c);
    assert!(validate_che_cluster(&c, Infrastructure::Base).is_ok());
    assert!(validate_che_cluster(&c, Infrastructure::Extended).is_ok());
}

#[test]
fn test_exactly_one_database_flavor() {
    // Managed database: valid without any endpoint configuration
    let mut managed = CheClusterSpec::default();
    managed.k8s.ingress_domain = "apps.example.com".to_string();
    assert!(validate_che_cluster(&cluster(managed), Infrastructure::Base).is_ok());

    // External database: endpoint and credentials are mandatory
    let mut external = CheClusterSpec::default();
    external.k8s.ingress_domain = "apps.example.com".to_string();
    external.database.external_db = true;
    assert!(validate_che_cluster(&cluster(external.clone()), Infrastructure::Base).is_err());

    external.database.che_postgres_hostname = "db.corp".to_string();
    external.database.che_postgres_secret = "db-creds".to_string();
    assert!(validate_che_cluster(&cluster(external), Infrastructure::Base).is_ok());
}

#[test]
fn test_identity_provider_pair_invariant() {
    let mut base = CheClusterSpec::default();
    base.k8s.ingress_domain = "apps.example.com".to_string();

    // (true, empty) is invalid
    let mut spec = base.clone();
    spec.auth.external_identity_provider = true;
    assert!(validate_che_cluster(&cluster(spec), Infrastructure::Base).is_err());

    // (false, non-empty) is invalid
    let mut spec = base.clone();
    spec.auth.identity_provider_url = "https://keycloak.corp".to_string();
    assert!(validate_che_cluster(&cluster(spec), Infrastructure::Base).is_err());

    // (true, non-empty) is valid
    let mut spec = base;
    spec.auth.external_identity_provider = true;
    spec.auth.identity_provider_url = "https://keycloak.corp".to_string();
    assert!(validate_che_cluster(&cluster(spec), Infrastructure::Base).is_ok());
}

#[test]
fn test_validation_errors_are_terminal() {
    let mut spec = CheClusterSpec::default();
    spec.k8s.ingress_domain = "apps.example.com".to_string();
    spec.auth.external_identity_provider = true;
    let err = validate_che_cluster(&cluster(spec), Infrastructure::Base).unwrap_err();
    assert!(!err.is_retryable());
}

#[test]
fn test_oauth_flavor_restriction() {
    let mut spec = CheClusterSpec::default();
    spec.k8s.ingress_domain = "apps.example.com".to_string();
    spec.auth.open_shift_oauth = true;
    assert!(validate_che_cluster(&cluster(spec.clone()), Infrastructure::Base).is_err());
    assert!(validate_che_cluster(&cluster(spec), Infrastructure::Extended).is_ok());
}
