//! CheCluster spec validation.
//!
//! Violations are terminal for the current spec: they are written to the
//! status and the CR is not requeued until the user edits it.

use crate::controller::error::{Error, Result};
use crate::crd::CheCluster;
use crate::platform::Infrastructure;

/// Validate the CheCluster invariants before the pipeline runs
pub fn validate_che_cluster(cluster: &CheCluster, infrastructure: Infrastructure) -> Result<()> {
    let spec = &cluster.spec;

    // Exactly one of {external DB, managed DB}: an external database must
    // name its endpoint and credentials
    if spec.database.external_db {
        if spec.database.che_postgres_hostname.is_empty() {
            return Err(Error::ValidationError(
                "spec.database.chePostgresHostname is required when externalDb is true".to_string(),
            ));
        }
        if spec.database.che_postgres_secret.is_empty() {
            return Err(Error::ValidationError(
                "spec.database.chePostgresSecret is required when externalDb is true".to_string(),
            ));
        }
    }

    // (externalIdentityProvider, identityProviderURL) must be
    // (true, non-empty) or (false, empty)
    if spec.auth.external_identity_provider && spec.auth.identity_provider_url.is_empty() {
        return Err(Error::ValidationError(
            "spec.auth.identityProviderURL is required when externalIdentityProvider is true"
                .to_string(),
        ));
    }
    if !spec.auth.external_identity_provider && !spec.auth.identity_provider_url.is_empty() {
        return Err(Error::ValidationError(
            "spec.auth.identityProviderURL must be empty when externalIdentityProvider is false"
                .to_string(),
        ));
    }

    // The integrated OAuth server only exists on the extended flavor
    if spec.auth.open_shift_oauth && infrastructure == Infrastructure::Base {
        return Err(Error::ValidationError(
            "spec.auth.openShiftOAuth requires an extended cluster".to_string(),
        ));
    }

    // Base clusters cannot assign hostnames; one must be derivable
    if infrastructure == Infrastructure::Base
        && spec.server.che_host.is_empty()
        && spec.k8s.ingress_domain.is_empty()
    {
        return Err(Error::ValidationError(
            "spec.k8s.ingressDomain is required on this cluster when spec.server.cheHost is empty"
                .to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CheClusterSpec;
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

    fn valid_base_spec() -> CheClusterSpec {
        let mut spec = CheClusterSpec::default();
        spec.k8s.ingress_domain = "apps.example.com".to_string();
        spec
    }

    #[test]
    fn test_valid_default_spec() {
        let c = cluster(valid_base_spec());
        assert!(validate_che_cluster(&c, Infrastructure::Base).is_ok());
    }

    #[test]
    fn test_external_db_requires_hostname() {
        let mut spec = valid_base_spec();
        spec.database.external_db = true;
        spec.database.che_postgres_secret = "db-creds".to_string();
        let c = cluster(spec);
        let err = validate_che_cluster(&c, Infrastructure::Base).unwrap_err();
        assert!(err.to_string().contains("chePostgresHostname"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_external_db_requires_secret() {
        let mut spec = valid_base_spec();
        spec.database.external_db = true;
        spec.database.che_postgres_hostname = "db.corp".to_string();
        let c = cluster(spec);
        let err = validate_che_cluster(&c, Infrastructure::Base).unwrap_err();
        assert!(err.to_string().contains("chePostgresSecret"));
    }

    #[test]
    fn test_identity_provider_url_pairing() {
        let mut spec = valid_base_spec();
        spec.auth.external_identity_provider = true;
        let c = cluster(spec);
        assert!(validate_che_cluster(&c, Infrastructure::Base).is_err());

        let mut spec = valid_base_spec();
        spec.auth.identity_provider_url = "https://keycloak.corp".to_string();
        let c = cluster(spec);
        assert!(validate_che_cluster(&c, Infrastructure::Base).is_err());

        let mut spec = valid_base_spec();
        spec.auth.external_identity_provider = true;
        spec.auth.identity_provider_url = "https://keycloak.corp".to_string();
        let c = cluster(spec);
        assert!(validate_che_cluster(&c, Infrastructure::Base).is_ok());
    }

    #[test]
    fn test_oauth_needs_extended_cluster() {
        let mut spec = valid_base_spec();
        spec.auth.open_shift_oauth = true;
        let c = cluster(spec);
        assert!(validate_che_cluster(&c, Infrastructure::Base).is_err());
        assert!(validate_che_cluster(&c, Infrastructure::Extended).is_ok());
    }

    #[test]
    fn test_base_cluster_needs_host_or_domain() {
        let c = cluster(CheClusterSpec::default());
        assert!(validate_che_cluster(&c, Infrastructure::Base).is_err());
        // Extended clusters assign hostnames themselves
        assert!(validate_che_cluster(&c, Infrastructure::Extended).is_ok());
    }
}
