pub mod backup;
pub mod controller;
pub mod crd;
pub mod deploy;
pub mod health;
pub mod platform;
pub mod sync;

pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile_che_cluster,
};
pub use crd::{CheCluster, CheClusterBackup, CheClusterRestore};
pub use health::{HealthState, Metrics};
pub use platform::{ImageDefaults, Infrastructure, ProxySettings};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use controller::{backup_reconciler, restore_reconciler};

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the CheCluster controller.
///
/// Watches CheCluster resources and every owned workload object, and
/// reconciles them through the sub-reconciler pipeline. `namespace` scopes
/// the watches; `None` watches cluster-wide.
pub async fn run_che_controller(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!("Starting controller for CheCluster resources (scope: {})", scope_msg);

    if let Some(ref state) = ctx.health {
        state.set_ready(true).await;
    }

    let client = ctx.client.clone();
    let clusters: Api<CheCluster> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let service_accounts: Api<ServiceAccount> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns(deployments, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(secrets, watcher_config.clone())
        .owns(service_accounts, watcher_config)
        .run(reconcile_che_cluster, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled CheCluster: {}", obj.name);
                }
                Err(e) => {
                    // NotFound errors are expected after deletion when watch
                    // events trigger reconciliation for a deleted object
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _)
                            if format!("{:?}", err).contains("NotFound")
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("CheCluster controller stream ended unexpectedly");
}

/// Run the CheClusterBackup controller.
pub async fn run_backup_controller(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for CheClusterBackup resources (scope: {})",
        scope_msg
    );

    let client = ctx.client.clone();
    let backups: Api<CheClusterBackup> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client, namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(backups, watcher_config.clone())
        .owns(deployments, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(secrets, watcher_config)
        .run(
            backup_reconciler::reconcile_backup,
            backup_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled CheClusterBackup: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Backup reconciliation error: {:?}", e);
                }
            }
        })
        .await;

    tracing::error!("CheClusterBackup controller stream ended unexpectedly");
}

/// Run the CheClusterRestore controller.
pub async fn run_restore_controller(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for CheClusterRestore resources (scope: {})",
        scope_msg
    );

    let client = ctx.client.clone();
    let restores: Api<CheClusterRestore> = scoped_api(client, namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    // Restores deliberately own nothing: the workloads they touch belong to
    // the CheCluster that is recreated afterwards
    Controller::new(restores, watcher_config)
        .run(
            restore_reconciler::reconcile_restore,
            restore_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled CheClusterRestore: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Restore reconciliation error: {:?}", e);
                }
            }
        })
        .await;

    tracing::error!("CheClusterRestore controller stream ended unexpectedly");
}
