use crate::crd::CheCluster;

/// In-cluster API service hostname, always excluded from proxying
const API_SERVICE_HOST: &str = "kubernetes.default.svc";

/// Resolved proxy settings for the managed workloads.
///
/// Cluster-wide settings come from the operator's own environment; the CR
/// may override them per installation. The noProxy list always includes the
/// in-cluster API service hostname so workloads can reach the API server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl ProxySettings {
    /// Merge cluster-wide proxy settings with CR-level overrides
    pub fn resolve(cluster: &CheCluster) -> Self {
        let server = &cluster.spec.server;

        let (http_proxy, https_proxy) = if !server.proxy_url.is_empty() {
            let url = if server.proxy_port.is_empty() {
                server.proxy_url.clone()
            } else {
                format!("{}:{}", server.proxy_url, server.proxy_port)
            };
            (url.clone(), url)
        } else {
            (
                std::env::var("HTTP_PROXY").unwrap_or_default(),
                std::env::var("HTTPS_PROXY").unwrap_or_default(),
            )
        };

        let mut no_proxy_hosts: Vec<String> = if !server.non_proxy_hosts.is_empty() {
            server.non_proxy_hosts.split('|').map(str::to_string).collect()
        } else {
            std::env::var("NO_PROXY")
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        if !no_proxy_hosts.iter().any(|h| h == API_SERVICE_HOST) {
            no_proxy_hosts.push(API_SERVICE_HOST.to_string());
        }

        Self {
            http_proxy,
            https_proxy,
            no_proxy: no_proxy_hosts.join(","),
        }
    }

    /// Whether any proxy is configured at all
    pub fn is_configured(&self) -> bool {
        !self.http_proxy.is_empty() || !self.https_proxy.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CheClusterSpec;
    use kube::core::ObjectMeta;

    fn cluster_with_proxy(url: &str, port: &str, non_proxy: &str) -> CheCluster {
        let mut spec = CheClusterSpec::default();
        spec.server.proxy_url = url.to_string();
        spec.server.proxy_port = port.to_string();
        spec.server.non_proxy_hosts = non_proxy.to_string();
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
    fn test_cr_override_with_port() {
        let cluster = cluster_with_proxy("http://proxy.corp", "3128", "");
        let proxy = ProxySettings::resolve(&cluster);
        assert_eq!(proxy.http_proxy, "http://proxy.corp:3128");
        assert_eq!(proxy.https_proxy, "http://proxy.corp:3128");
        assert!(proxy.is_configured());
    }

    #[test]
    fn test_no_proxy_always_contains_api_service() {
        let cluster = cluster_with_proxy("http://proxy.corp", "", "internal.corp|10.0.0.0/8");
        let proxy = ProxySettings::resolve(&cluster);
        assert!(proxy.no_proxy.contains("kubernetes.default.svc"));
        assert!(proxy.no_proxy.contains("internal.corp"));
        assert!(proxy.no_proxy.contains("10.0.0.0/8"));
    }

    #[test]
    fn test_unconfigured() {
        let cluster = cluster_with_proxy("", "", "");
        let proxy = ProxySettings::resolve(&cluster);
        // Only guaranteed when the operator environment itself has no proxy
        assert!(proxy.no_proxy.contains("kubernetes.default.svc"));
    }
}
