//! Backup data restorer, the reverse of the collector.
//!
//! Tears down the derived workloads so nothing writes to the database while
//! dumps are replayed, restores the databases inside the Postgres pod, then
//! recreates the CheCluster CR so the install reconciler brings everything
//! back up from the restored state.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::backup::collect::CHE_CR_FILE;
use crate::backup::pod_exec::{exec_in_database_pod, find_database_pod};
use crate::backup::BackupError;
use crate::crd::CheCluster;
use crate::deploy::{CA_BUNDLE_SELECTOR, IDENTITY_PROVIDER_DEPLOYMENT_NAME, SERVER_DEPLOYMENT_NAME};

/// Poll interval for deletion waits
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bound on each deletion wait
const WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Replay a downloaded snapshot into the cluster
pub async fn restore_backup_data(
    client: &Client,
    namespace: &str,
    staging: &Path,
) -> Result<(), BackupError> {
    let manifest = read_che_cr(staging).await?;

    delete_che_cluster(client, namespace).await?;
    delete_workloads(client, namespace).await?;
    delete_ca_bundles(client, namespace).await?;
    restore_databases(client, namespace, staging).await?;
    recreate_che_cluster(client, namespace, manifest).await?;

    info!("Backup data restored, install reconciler will converge the workloads");
    Ok(())
}

/// Load the CheCluster manifest from the archive
async fn read_che_cr(staging: &Path) -> Result<CheCluster, BackupError> {
    let path = staging.join(CHE_CR_FILE);
    let yaml = tokio::fs::read_to_string(&path).await.map_err(|_| {
        BackupError::Failed(format!("backup data has no {} manifest", CHE_CR_FILE))
    })?;
    serde_yaml::from_str(&yaml).map_err(BackupError::YamlError)
}

/// Delete the current CheCluster CR and wait until it is gone, so the
/// install reconciler stops fighting the restored state
async fn delete_che_cluster(client: &Client, namespace: &str) -> Result<(), BackupError> {
    let clusters: Api<CheCluster> = Api::namespaced(client.clone(), namespace);

    let existing = clusters.list(&ListParams::default()).await?;
    for cluster in existing {
        let name = cluster.name_any();
        info!(name = %name, "Deleting CheCluster before restore");
        match clusters.delete(&name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => continue,
            Err(e) => return Err(e.into()),
        }

        wait_for_cluster_gone(&clusters, &name).await?;
    }

    Ok(())
}

/// Wait until the CheCluster with the given name no longer exists
async fn wait_for_cluster_gone(
    clusters: &Api<CheCluster>,
    name: &str,
) -> Result<(), BackupError> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if clusters.get_opt(name).await?.is_none() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BackupError::WaitTimeout(format!(
                "CheCluster {} deletion",
                name
            )));
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

/// Delete the server and identity-provider deployments and wait for their
/// pods to terminate. Dropping a database while a pod still holds
/// connections would fail, so the wait is not optional.
async fn delete_workloads(client: &Client, namespace: &str) -> Result<(), BackupError> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    for name in [SERVER_DEPLOYMENT_NAME, IDENTITY_PROVIDER_DEPLOYMENT_NAME] {
        match deployments.delete(name, &Default::default()).await {
            Ok(_) => debug!(deployment = %name, "Deleted workload before restore"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    for component in ["che-server", "keycloak"] {
        let selector = format!(
            "app.kubernetes.io/component={},app.kubernetes.io/part-of=che.eclipse.org",
            component
        );
        wait_for_pods_gone(&pods, &selector, component).await?;
    }

    Ok(())
}

/// Wait until no pod matches the selector
async fn wait_for_pods_gone(
    pods: &Api<Pod>,
    selector: &str,
    component: &str,
) -> Result<(), BackupError> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        if list.items.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BackupError::WaitTimeout(format!(
                "{} pods termination",
                component
            )));
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

/// Delete every CA-bundle config map; the archive carries the replacements
async fn delete_ca_bundles(client: &Client, namespace: &str) -> Result<(), BackupError> {
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let bundles = config_maps
        .list(&ListParams::default().labels(CA_BUNDLE_SELECTOR))
        .await?;

    for bundle in bundles {
        let name = bundle.name_any();
        match config_maps.delete(&name, &Default::default()).await {
            Ok(_) => debug!(configmap = %name, "Deleted CA-bundle config map"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Stream every dump from the archive into the Postgres pod and replay it
async fn restore_databases(
    client: &Client,
    namespace: &str,
    staging: &Path,
) -> Result<(), BackupError> {
    let db_dir = staging.join("db");
    if !tokio::fs::try_exists(&db_dir).await? {
        debug!("Backup data has no database dumps, skipping database restore");
        return Ok(());
    }

    let mut dumps = Vec::new();
    let mut entries = tokio::fs::read_dir(&db_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "pgdump")
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        {
            dumps.push((stem.to_string(), path));
        }
    }

    if dumps.is_empty() {
        debug!("Backup data has no database dumps, skipping database restore");
        return Ok(());
    }

    let pod_name = find_database_pod(client, namespace).await?;

    for (database, path) in dumps {
        let dump = tokio::fs::read(&path).await?;
        // The dump carries its own CREATE DATABASE, so pg_restore connects
        // to the maintenance database after the drop
        let script = format!(
            "dropdb -U postgres --if-exists {db} && pg_restore -U postgres --create --dbname postgres",
            db = database,
        );
        info!(database = %database, "Restoring database dump");
        exec_in_database_pod(client, namespace, &pod_name, &script, Some(&dump)).await?;
    }

    Ok(())
}

/// Recreate the CheCluster from the archived manifest
async fn recreate_che_cluster(
    client: &Client,
    namespace: &str,
    mut manifest: CheCluster,
) -> Result<(), BackupError> {
    manifest.metadata.namespace = Some(namespace.to_string());
    // Status is carried in the archive for reference but cannot be created
    manifest.status = None;

    let clusters: Api<CheCluster> = Api::namespaced(client.clone(), namespace);
    match clusters.create(&PostParams::default(), &manifest).await {
        Ok(_) => {
            info!(name = %manifest.name_any(), "Recreated CheCluster from backup");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            // A previous attempt already recreated it
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

