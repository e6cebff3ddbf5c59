//! Backup data collector.
//!
//! Gathers everything a restore needs into a staging directory:
//!
//! ```text
//! <staging>/
//!   backup-data.txt         metadata header
//!   che-cr.yaml             the CheCluster at snapshot time
//!   db/<name>.pgdump        one pg_dump(-Fc) per database
//!   configmaps/<name>.yaml  each CA-bundle config map
//! ```

use std::path::Path;

use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::pod_exec::{exec_in_database_pod, find_database_pod};
use crate::backup::BackupError;
use crate::crd::CheCluster;
use crate::deploy::CA_BUNDLE_SELECTOR;
use crate::platform::Infrastructure;

/// Version of the backup archive layout
pub const METADATA_FILE_VERSION: &str = "1.0";

/// Name of the metadata header file
pub const METADATA_FILE: &str = "backup-data.txt";

/// Name of the serialized CheCluster manifest
pub const CHE_CR_FILE: &str = "che-cr.yaml";

/// In-pod scratch directory for dumps before they are streamed out
const POD_DUMP_DIR: &str = "/tmp/che-backup";

/// Metadata header written at the root of every archive
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub metadata_file_version: String,
    pub che_version: String,
    pub infrastructure: String,
    pub creation_date: String,
}

/// Databases to dump for a cluster.
///
/// The list follows the CR flavor: the Che database name comes from the
/// spec when set, and the identity provider database is only present for a
/// managed identity provider. An externally managed database is not dumped
/// at all: there is no managed pod to run `pg_dump` in.
pub fn databases_for(cluster: &CheCluster) -> Vec<String> {
    if cluster.spec.database.external_db {
        return Vec::new();
    }

    let che_db = if cluster.spec.database.che_postgres_db.is_empty() {
        "dbche".to_string()
    } else {
        cluster.spec.database.che_postgres_db.clone()
    };

    let mut databases = vec![che_db];
    if !cluster.spec.auth.external_identity_provider {
        databases.push("keycloak".to_string());
    }
    databases
}

/// Collect all backup data for the installation into `staging`
pub async fn collect_backup_data(
    client: &Client,
    namespace: &str,
    cluster: &CheCluster,
    infrastructure: Infrastructure,
    staging: &Path,
    databases: &[String],
) -> Result<(), BackupError> {
    prepare_staging_dir(staging).await?;
    write_che_cr(cluster, staging).await?;
    dump_databases(client, namespace, staging, databases).await?;
    collect_ca_bundles(client, namespace, staging).await?;
    write_metadata(cluster, infrastructure, staging).await?;

    info!(staging = %staging.display(), "Backup data collected");
    Ok(())
}

/// Empty the staging directory, or create it (0755) when missing
pub async fn prepare_staging_dir(staging: &Path) -> Result<(), BackupError> {
    if tokio::fs::try_exists(staging).await? {
        let mut entries = tokio::fs::read_dir(staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
    } else {
        tokio::fs::create_dir_all(staging).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(staging, std::fs::Permissions::from_mode(0o755)).await?;
        }
    }
    Ok(())
}

/// Serialize the CheCluster to `che-cr.yaml` (0600), stripping the
/// server-assigned metadata so the manifest can be recreated as-is
async fn write_che_cr(cluster: &CheCluster, staging: &Path) -> Result<(), BackupError> {
    let mut manifest = cluster.clone();
    manifest.metadata.resource_version = None;
    manifest.metadata.uid = None;
    manifest.metadata.creation_timestamp = None;
    manifest.metadata.generation = None;
    manifest.metadata.managed_fields = None;
    manifest.metadata.finalizers = None;
    manifest.metadata.deletion_timestamp = None;
    manifest.metadata.deletion_grace_period_seconds = None;
    manifest.metadata.owner_references = None;

    let yaml = serde_yaml::to_string(&manifest)?;
    let path = staging.join(CHE_CR_FILE);
    tokio::fs::write(&path, yaml).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Dump each database inside the Postgres pod and stream it into
/// `db/<name>.pgdump`
async fn dump_databases(
    client: &Client,
    namespace: &str,
    staging: &Path,
    databases: &[String],
) -> Result<(), BackupError> {
    let db_dir = staging.join("db");
    tokio::fs::create_dir_all(&db_dir).await?;

    if databases.is_empty() {
        warn!("No managed databases to dump for this cluster flavor");
        return Ok(());
    }

    let pod_name = find_database_pod(client, namespace).await?;

    // Dump everything first so a failure aborts before any bytes leave the pod
    for database in databases {
        let dump_script = format!(
            "mkdir -p {dir} && pg_dump -U postgres -Fc -f {dir}/{db}.pgdump {db}",
            dir = POD_DUMP_DIR,
            db = database,
        );
        exec_in_database_pod(client, namespace, &pod_name, &dump_script, None).await?;
    }

    for database in databases {
        let stream_script = format!(
            "cat {dir}/{db}.pgdump && rm -f {dir}/{db}.pgdump",
            dir = POD_DUMP_DIR,
            db = database,
        );
        let dump = exec_in_database_pod(client, namespace, &pod_name, &stream_script, None).await?;
        if dump.is_empty() {
            return Err(BackupError::PodExecFailed(format!(
                "dump of database {} is empty",
                database
            )));
        }
        tokio::fs::write(db_dir.join(format!("{}.pgdump", database)), dump).await?;
        info!(database = %database, "Database dump collected");
    }

    Ok(())
}

/// Serialize every CA-bundle config map into `configmaps/<name>.yaml`
async fn collect_ca_bundles(
    client: &Client,
    namespace: &str,
    staging: &Path,
) -> Result<(), BackupError> {
    let cm_dir = staging.join("configmaps");
    tokio::fs::create_dir_all(&cm_dir).await?;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let bundles = config_maps
        .list(&ListParams::default().labels(CA_BUNDLE_SELECTOR))
        .await?;

    for bundle in bundles {
        let name = bundle.name_any();
        let mut manifest = bundle;
        manifest.metadata.resource_version = None;
        manifest.metadata.uid = None;
        manifest.metadata.creation_timestamp = None;
        manifest.metadata.managed_fields = None;
        manifest.metadata.owner_references = None;

        let yaml = serde_yaml::to_string(&manifest)?;
        tokio::fs::write(cm_dir.join(format!("{}.yaml", name)), yaml).await?;
    }

    Ok(())
}

/// Write the `backup-data.txt` metadata header
async fn write_metadata(
    cluster: &CheCluster,
    infrastructure: Infrastructure,
    staging: &Path,
) -> Result<(), BackupError> {
    let metadata = BackupMetadata {
        metadata_file_version: METADATA_FILE_VERSION.to_string(),
        che_version: cluster
            .status
            .as_ref()
            .map(|s| s.che_version.clone())
            .unwrap_or_default(),
        infrastructure: infrastructure.to_string(),
        creation_date: Utc::now().to_rfc3339(),
    };

    let yaml = serde_yaml::to_string(&metadata)?;
    tokio::fs::write(staging.join(METADATA_FILE), yaml).await?;
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

    #[test]
    fn test_default_database_set() {
        let c = cluster(CheClusterSpec::default());
        assert_eq!(databases_for(&c), vec!["dbche", "keycloak"]);
    }

    #[test]
    fn test_custom_che_database_name() {
        let mut spec = CheClusterSpec::default();
        spec.database.che_postgres_db = "chedb".to_string();
        let c = cluster(spec);
        assert_eq!(databases_for(&c), vec!["chedb", "keycloak"]);
    }

    #[test]
    fn test_external_identity_provider_skips_keycloak() {
        let mut spec = CheClusterSpec::default();
        spec.auth.external_identity_provider = true;
        spec.auth.identity_provider_url = "https://keycloak.corp".to_string();
        let c = cluster(spec);
        assert_eq!(databases_for(&c), vec!["dbche"]);
    }

    #[test]
    fn test_external_db_dumps_nothing() {
        let mut spec = CheClusterSpec::default();
        spec.database.external_db = true;
        let c = cluster(spec);
        assert!(databases_for(&c).is_empty());
    }

    #[tokio::test]
    async fn test_prepare_staging_dir_empties_existing() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        tokio::fs::create_dir_all(staging.join("db")).await.unwrap();
        tokio::fs::write(staging.join("stale.txt"), b"old").await.unwrap();

        prepare_staging_dir(&staging).await.unwrap();

        let mut entries = tokio::fs::read_dir(&staging).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[test]
    fn test_metadata_round_trip() {
        let metadata = BackupMetadata {
            metadata_file_version: METADATA_FILE_VERSION.to_string(),
            che_version: "7.30.1".to_string(),
            infrastructure: "kubernetes".to_string(),
            creation_date: "2021-05-10T12:00:00+00:00".to_string(),
        };
        let yaml = serde_yaml::to_string(&metadata).unwrap();
        assert!(yaml.contains("metadataFileVersion"));
        let parsed: BackupMetadata = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, metadata);
    }
}
