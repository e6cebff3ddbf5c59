use kube::Client;
use kube::discovery::Discovery;
use tracing::info;

/// The API group whose presence distinguishes the extended flavor
const EXTENDED_API_GROUP: &str = "route.openshift.io";

/// Orchestrator flavor the operator runs on.
///
/// `Extended` clusters carry routes, an integrated OAuth server and projects;
/// `Base` clusters expose workloads through Ingress objects and bring their
/// own TLS secrets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Infrastructure {
    Base,
    Extended,
}

impl Infrastructure {
    /// Probe the discovery API for the distinguishing API group.
    ///
    /// Called once at startup; the result is carried in the controller
    /// context for the lifetime of the process.
    pub async fn detect(client: &Client) -> Result<Self, kube::Error> {
        let discovery = Discovery::new(client.clone())
            .filter(&[EXTENDED_API_GROUP])
            .run()
            .await?;

        let flavor = if discovery.has_group(EXTENDED_API_GROUP) {
            Infrastructure::Extended
        } else {
            Infrastructure::Base
        };

        info!(infrastructure = %flavor.as_str(), "Detected cluster infrastructure");
        Ok(flavor)
    }

    /// Whether the platform assigns public hostnames itself (routes)
    pub fn assigns_hostnames(&self) -> bool {
        matches!(self, Infrastructure::Extended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Infrastructure::Base => "kubernetes",
            Infrastructure::Extended => "openshift",
        }
    }
}

impl std::fmt::Display for Infrastructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
