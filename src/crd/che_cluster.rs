use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CheCluster is the Schema for the checlusters API
///
/// A CheCluster describes the desired state of a full Che installation in a
/// namespace. The operator continuously drives the cluster toward this state.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "org.eclipse.che",
    version = "v1",
    kind = "CheCluster",
    plural = "checlusters",
    shortname = "che",
    namespaced,
    status = "CheClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.cheVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.chePhase"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.cheURL"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheClusterSpec {
    /// Che server configuration
    #[serde(default)]
    pub server: ServerSpec,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseSpec,

    /// Identity provider configuration
    #[serde(default)]
    pub auth: AuthSpec,

    /// Workspace storage configuration
    #[serde(default)]
    pub storage: StorageSpec,

    /// Kubernetes-specific ingress and security settings
    #[serde(default)]
    pub k8s: K8sSpec,

    /// Metrics configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSpec>,

    /// Image puller integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_puller: Option<ImagePullerSpec>,

    /// DevWorkspace engine integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_workspace: Option<DevWorkspaceSpec>,
}

impl Default for CheClusterSpec {
    fn default() -> Self {
        Self {
            server: ServerSpec::default(),
            database: DatabaseSpec::default(),
            auth: AuthSpec::default(),
            storage: StorageSpec::default(),
            k8s: K8sSpec::default(),
            metrics: None,
            image_puller: None,
            dev_workspace: None,
        }
    }
}

/// Che server section of the CheCluster spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Che server image (without tag). Empty means the operator default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_image: String,

    /// Che server image tag. Empty means the operator default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_image_tag: String,

    /// Public hostname of the installation. Empty means the operator
    /// resolves one from the platform and writes it back.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_host: String,

    /// Serve the installation over TLS
    #[serde(default)]
    pub tls_support: bool,

    /// Che server log level (INFO, DEBUG, TRACE)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_log_level: String,

    /// Debug mode: omits readiness/liveness probes so a debugger can pause
    /// the server without the kubelet killing the pod
    #[serde(default)]
    pub che_debug: bool,

    /// Additional entries merged into the Che server configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_che_properties: BTreeMap<String, String>,

    /// User-supplied cluster roles to bind to the `che` service account.
    /// Each entry is tracked with its own finalizer on the CR.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub che_cluster_roles: Vec<String>,

    /// Proxy URL override (scheme and host, no port)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_url: String,

    /// Proxy port override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_port: String,

    /// Hosts excluded from proxying, `|`-separated
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub non_proxy_hosts: String,

    /// Devfile registry image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub devfile_registry_image: String,

    /// Plugin registry image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_registry_image: String,

    /// Dashboard image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dashboard_image: String,
}

/// Database section of the CheCluster spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Use an externally managed database instead of the operator-deployed one
    #[serde(default)]
    pub external_db: bool,

    /// Postgres hostname. Required when externalDb is true; defaulted to the
    /// managed service otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_postgres_hostname: String,

    /// Postgres port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_postgres_port: String,

    /// Che database name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_postgres_db: String,

    /// Secret holding `user` and `password` keys for the database
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_postgres_secret: String,

    /// Postgres image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub postgres_image: String,
}

/// Identity provider section of the CheCluster spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// Use an externally managed identity provider
    #[serde(default)]
    pub external_identity_provider: bool,

    /// Identity provider URL. Required when externalIdentityProvider is
    /// true; must be empty otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_provider_url: String,

    /// Realm used by the Che server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_provider_realm: String,

    /// OAuth client id used by the Che server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_provider_client_id: String,

    /// Secret holding `user` and `password` keys for the identity provider
    /// admin account
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_provider_secret: String,

    /// Enable login with the platform's integrated OAuth server
    /// (extended infrastructure only)
    #[serde(default)]
    pub open_shift_oauth: bool,

    /// Identity provider image override
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_provider_image: String,
}

/// Workspace storage section of the CheCluster spec
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// PVC strategy: `common`, `per-workspace` or `unique`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pvc_strategy: String,

    /// Claim size for workspace PVCs (e.g. "10Gi")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pvc_claim_size: String,

    /// Storage class for workspace PVCs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace_pvc_storage_class_name: String,
}

/// Kubernetes ingress and security settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct K8sSpec {
    /// Base DNS domain used to build ingress hostnames
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ingress_domain: String,

    /// Ingress class name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ingress_class: String,

    /// TLS secret presented by the ingress
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_secret_name: String,

    /// runAsUser for workload security contexts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_context_run_as_user: String,

    /// fsGroup for workload security contexts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_context_fs_group: String,
}

/// Metrics configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    /// Enable the Che server metrics endpoint
    pub enable: bool,
}

/// Image puller integration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullerSpec {
    /// Enable pre-pulling of workspace images on cluster nodes
    pub enable: bool,

    /// Settings passed through to the image puller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ImagePullerConfig>,
}

/// Image puller settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullerConfig {
    /// Name of the puller deployment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_name: String,

    /// Name of the puller config map
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map_name: String,

    /// Semicolon-separated `name=image` pairs to pre-pull
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub images: String,
}

/// DevWorkspace engine integration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevWorkspaceSpec {
    /// Enable the DevWorkspace engine
    pub enable: bool,
}

/// Status of the CheCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheClusterStatus {
    /// Current phase of the installation lifecycle
    #[serde(default)]
    pub che_phase: ChePhase,

    /// Version of the deployed Che server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub che_version: String,

    /// Public URL of the installation
    #[serde(default, rename = "cheURL", skip_serializing_if = "String::is_empty")]
    pub che_url: String,

    /// Public URL of the identity provider
    #[serde(default, rename = "keycloakURL", skip_serializing_if = "String::is_empty")]
    pub keycloak_url: String,

    /// The managed database has been provisioned
    #[serde(default)]
    pub db_provisioned: bool,

    /// The managed identity provider has been provisioned
    #[serde(default)]
    pub keycloak_provisioned: bool,

    /// OAuth client registration with the platform has been performed
    #[serde(default)]
    pub open_shift_oauth_provisioned: bool,

    /// Status of the DevWorkspace engine integration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_workspace_status: String,

    /// Most recent terminal message, if any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Installation lifecycle phase
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ChePhase {
    /// Phase has not been computed yet
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// No server replica is available
    Inactive,
    /// The server is fully rolled out and serving
    Active,
    /// A rollout is replacing server pods
    RollingUpdate,
    /// The installation cannot make progress without a spec change
    Failed,
}

impl std::fmt::Display for ChePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChePhase::Unknown => write!(f, "Unknown"),
            ChePhase::Inactive => write!(f, "Inactive"),
            ChePhase::Active => write!(f, "Active"),
            ChePhase::RollingUpdate => write!(f, "RollingUpdate"),
            ChePhase::Failed => write!(f, "Failed"),
        }
    }
}
