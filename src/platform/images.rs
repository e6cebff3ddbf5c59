use crate::crd::CheCluster;

/// Default image references for every managed component.
///
/// Read once from the operator's environment at startup so that rebuilding
/// the operator retags the whole constellation. The CR may override each
/// component individually.
#[derive(Clone, Debug)]
pub struct ImageDefaults {
    pub che_server: String,
    pub postgres: String,
    pub identity_provider: String,
    pub devfile_registry: String,
    pub plugin_registry: String,
    pub dashboard: String,
    pub backup_rest_server: String,
    pub che_version: String,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

impl ImageDefaults {
    /// Read the per-component defaults from `RELATED_IMAGE_*` variables
    pub fn from_env() -> Self {
        Self {
            che_server: env_or("RELATED_IMAGE_che_server", "quay.io/eclipse/che-server:latest"),
            postgres: env_or("RELATED_IMAGE_postgres", "quay.io/eclipse/che-postgres:latest"),
            identity_provider: env_or(
                "RELATED_IMAGE_keycloak",
                "quay.io/eclipse/che-keycloak:latest",
            ),
            devfile_registry: env_or(
                "RELATED_IMAGE_devfile_registry",
                "quay.io/eclipse/che-devfile-registry:latest",
            ),
            plugin_registry: env_or(
                "RELATED_IMAGE_plugin_registry",
                "quay.io/eclipse/che-plugin-registry:latest",
            ),
            dashboard: env_or(
                "RELATED_IMAGE_dashboard",
                "quay.io/eclipse/che-dashboard:latest",
            ),
            backup_rest_server: env_or(
                "RELATED_IMAGE_backup_rest_server",
                "restic/rest-server:latest",
            ),
            che_version: env_or("CHE_VERSION", "latest"),
        }
    }

    /// Che server image for a cluster, CR override first
    pub fn che_server_image(&self, cluster: &CheCluster) -> String {
        let server = &cluster.spec.server;
        if !server.che_image.is_empty() {
            let tag = if server.che_image_tag.is_empty() {
                &self.che_version
            } else {
                &server.che_image_tag
            };
            format!("{}:{}", server.che_image, tag)
        } else if !server.che_image_tag.is_empty() {
            match self.che_server.rsplit_once(':') {
                Some((repo, _)) => format!("{}:{}", repo, server.che_image_tag),
                None => format!("{}:{}", self.che_server, server.che_image_tag),
            }
        } else {
            self.che_server.clone()
        }
    }

    pub fn postgres_image(&self, cluster: &CheCluster) -> String {
        non_empty_or(&cluster.spec.database.postgres_image, &self.postgres)
    }

    pub fn identity_provider_image(&self, cluster: &CheCluster) -> String {
        non_empty_or(
            &cluster.spec.auth.identity_provider_image,
            &self.identity_provider,
        )
    }

    pub fn devfile_registry_image(&self, cluster: &CheCluster) -> String {
        non_empty_or(
            &cluster.spec.server.devfile_registry_image,
            &self.devfile_registry,
        )
    }

    pub fn plugin_registry_image(&self, cluster: &CheCluster) -> String {
        non_empty_or(
            &cluster.spec.server.plugin_registry_image,
            &self.plugin_registry,
        )
    }

    pub fn dashboard_image(&self, cluster: &CheCluster) -> String {
        non_empty_or(&cluster.spec.server.dashboard_image, &self.dashboard)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CheClusterSpec;
    use kube::core::ObjectMeta;

    fn defaults() -> ImageDefaults {
        ImageDefaults {
            che_server: "quay.io/eclipse/che-server:7.30".to_string(),
            postgres: "quay.io/eclipse/che-postgres:7.30".to_string(),
            identity_provider: "quay.io/eclipse/che-keycloak:7.30".to_string(),
            devfile_registry: "quay.io/eclipse/che-devfile-registry:7.30".to_string(),
            plugin_registry: "quay.io/eclipse/che-plugin-registry:7.30".to_string(),
            dashboard: "quay.io/eclipse/che-dashboard:7.30".to_string(),
            backup_rest_server: "restic/rest-server:0.10".to_string(),
            che_version: "7.30".to_string(),
        }
    }

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
    fn test_default_server_image() {
        let c = cluster(CheClusterSpec::default());
        assert_eq!(
            defaults().che_server_image(&c),
            "quay.io/eclipse/che-server:7.30"
        );
    }

    #[test]
    fn test_cr_image_override() {
        let mut spec = CheClusterSpec::default();
        spec.server.che_image = "registry.corp/che-server".to_string();
        spec.server.che_image_tag = "next".to_string();
        let c = cluster(spec);
        assert_eq!(defaults().che_server_image(&c), "registry.corp/che-server:next");
    }

    #[test]
    fn test_tag_only_override_retags_default() {
        let mut spec = CheClusterSpec::default();
        spec.server.che_image_tag = "nightly".to_string();
        let c = cluster(spec);
        assert_eq!(
            defaults().che_server_image(&c),
            "quay.io/eclipse/che-server:nightly"
        );
    }

    #[test]
    fn test_component_overrides() {
        let mut spec = CheClusterSpec::default();
        spec.database.postgres_image = "registry.corp/pg:13".to_string();
        let c = cluster(spec);
        let d = defaults();
        assert_eq!(d.postgres_image(&c), "registry.corp/pg:13");
        assert_eq!(d.dashboard_image(&c), "quay.io/eclipse/che-dashboard:7.30");
    }
}
