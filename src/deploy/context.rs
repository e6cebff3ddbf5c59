use kube::Client;
use kube::ResourceExt;

use crate::crd::CheCluster;
use crate::platform::{ImageDefaults, Infrastructure, ProxySettings};

/// Per-pass bundle handed to every sub-reconciler.
///
/// Holds the CR as observed at the start of the pass plus the resolved
/// platform facts. Sub-reconcilers that write the CR back (defaults, host
/// exposure) update the in-memory copy too, so downstream reconcilers in
/// the same pass see the new values.
pub struct DeployContext {
    pub che_cluster: CheCluster,
    pub namespace: String,
    /// Resolved public hostname of the installation, empty until the host
    /// exposure layer assigns one
    pub che_host: String,
    /// Hostname assigned by the platform, when the platform auto-assigns
    pub default_che_host: String,
    pub proxy: ProxySettings,
    pub infrastructure: Infrastructure,
    pub images: ImageDefaults,
    pub client: Client,
}

impl DeployContext {
    pub fn new(
        che_cluster: CheCluster,
        infrastructure: Infrastructure,
        images: ImageDefaults,
        client: Client,
    ) -> Self {
        let namespace = che_cluster.namespace().unwrap_or_else(|| "default".to_string());
        let proxy = ProxySettings::resolve(&che_cluster);
        let che_host = che_cluster.spec.server.che_host.clone();

        Self {
            che_cluster,
            namespace,
            che_host,
            default_che_host: String::new(),
            proxy,
            infrastructure,
            images,
            client,
        }
    }

    /// Name of the CheCluster CR
    pub fn cluster_name(&self) -> String {
        self.che_cluster.name_any()
    }

    /// URL scheme for the public endpoint
    pub fn scheme(&self) -> &'static str {
        if self.tls_enabled() { "https" } else { "http" }
    }

    /// Whether the public endpoint is served over TLS. Extended platforms
    /// always terminate TLS at the route.
    pub fn tls_enabled(&self) -> bool {
        self.che_cluster.spec.server.tls_support
            || self.infrastructure == Infrastructure::Extended
    }

    /// The public URL, once a host is resolved
    pub fn che_url(&self) -> String {
        if self.che_host.is_empty() {
            String::new()
        } else {
            format!("{}://{}", self.scheme(), self.che_host)
        }
    }
}
