//! Reconciliation logic for CheClusterBackup resources.
//!
//! A backup attempt starts when `spec.triggerNow` turns true and runs to a
//! terminal state in one logical attempt: provision the internal server if
//! requested, prepare the repository, collect the installation state into
//! the staging directory and ship it as a snapshot. The trigger flag is
//! reset whatever the outcome, so one trigger means one attempt.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::backup::collect::{collect_backup_data, databases_for};
use crate::backup::internal_server::{
    ensure_internal_backup_server, internal_rest_config, is_internal_server_ready,
};
use crate::backup::{resolve_backup_server, BackupError, SnapshotStat, BACKUP_STAGING_DIR};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::state_machine::{next_backup_state, BackupEvent};
use crate::controller::status::update_backup_status;
use crate::crd::{BackupServerType, BackupState, CheCluster, CheClusterBackup};

/// Attempts to persist the `triggerNow` reset; losing this write would
/// repeat the backup on the next pass
const TRIGGER_RESET_ATTEMPTS: u32 = 5;

/// Main reconciliation function
#[instrument(skip(backup, ctx), fields(name = %backup.name_any(), namespace = backup.namespace().unwrap_or_default()))]
pub async fn reconcile_backup(
    backup: Arc<CheClusterBackup>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let ns = backup.namespace().unwrap_or_default();
    let name = backup.name_any();

    if !backup.spec.trigger_now {
        return Ok(Action::await_change());
    }

    let current_state = backup.status.as_ref().map(|s| s.state).unwrap_or_default();
    let Some(next_state) = next_backup_state(current_state, BackupEvent::TriggerRequested) else {
        warn!(state = %current_state, "Trigger ignored in current state");
        return Ok(Action::await_change());
    };

    // The staging directory is shared across CR kinds; only one backup or
    // restore may run at a time
    let Ok(_staging_guard) = ctx.staging_lock.try_lock() else {
        info!("Another backup or restore operation is in progress, waiting");
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    if current_state != BackupState::InProgress {
        update_backup_status(&ctx.client, &ns, &name, next_state, "", "Backup is in progress")
            .await?;
    }

    match run_backup_attempt(&backup, &ctx, &ns).await {
        Ok(Outcome::NotReady) => {
            // Internal server pod still starting; short-delay requeue
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        Ok(Outcome::Finished(stat)) => {
            reset_trigger(&ctx, &ns, &name).await?;
            let state = next_backup_state(BackupState::InProgress, BackupEvent::AttemptSucceeded)
                .unwrap_or(BackupState::Succeeded);
            let message = format!("Backup successfully finished at {}", Utc::now().to_rfc3339());
            update_backup_status(&ctx.client, &ns, &name, state, &stat.id, &message).await?;
            info!(snapshot = %stat.id, "Backup finished");
            Ok(Action::await_change())
        }
        Err(e) if e.is_retryable() => {
            warn!("Transient backup error, will retry: {}", e);
            Err(e)
        }
        Err(e) => {
            error!("Backup failed: {}", e);
            reset_trigger(&ctx, &ns, &name).await?;
            let state = next_backup_state(BackupState::InProgress, BackupEvent::AttemptFailed)
                .unwrap_or(BackupState::Failed);
            update_backup_status(&ctx.client, &ns, &name, state, "", &e.to_string()).await?;
            Ok(Action::await_change())
        }
    }
}

enum Outcome {
    /// The internal backup server is not serving yet
    NotReady,
    /// Snapshot stored
    Finished(SnapshotStat),
}

async fn run_backup_attempt(
    backup: &CheClusterBackup,
    ctx: &Context,
    ns: &str,
) -> Result<Outcome> {
    let mut spec = backup.spec.clone();

    if spec.use_internal_backup_server {
        let ready = ensure_internal_backup_server(&ctx.client, ns, backup, &ctx.images).await?;
        if !ready || !is_internal_server_ready(ns).await? {
            return Ok(Outcome::NotReady);
        }

        // Point the CR at the provisioned server and blank the other
        // variants, so the repository location is visible to the user and
        // to a later restore
        spec.servers.rest = Some(internal_rest_config(ns));
        spec.servers.sftp = None;
        spec.servers.awss3 = None;
        spec.server_type = Some(BackupServerType::Rest);

        let api: Api<CheClusterBackup> = Api::namespaced(ctx.client.clone(), ns);
        // Explicit nulls: a merge patch only clears fields it names
        let patch = json!({ "spec": {
            "servers": {
                "rest": &spec.servers.rest,
                "sftp": serde_json::Value::Null,
                "awss3": serde_json::Value::Null,
            },
            "serverType": spec.server_type,
        }});
        api.patch(
            &backup.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    }

    let mut server = resolve_backup_server(&spec.servers, spec.server_type)?;
    server.prepare_configuration(&ctx.client, ns).await?;

    if !server.is_repository_exist().await? {
        server.init_repository().await?;
    }
    server.check_repository().await?;

    let cluster = find_che_cluster(ctx, ns).await?;
    let staging = Path::new(BACKUP_STAGING_DIR);

    let databases = databases_for(&cluster);
    let result = async {
        collect_backup_data(
            &ctx.client,
            ns,
            &cluster,
            ctx.infrastructure,
            staging,
            &databases,
        )
        .await?;
        server.send_snapshot(staging).await
    }
    .await;

    // The staging directory holds database dumps; always clean it up
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!("Failed to clean backup staging directory: {}", e);
    }

    Ok(Outcome::Finished(result?))
}

/// The CheCluster whose state is being captured
async fn find_che_cluster(ctx: &Context, ns: &str) -> Result<CheCluster, BackupError> {
    let clusters: Api<CheCluster> = Api::namespaced(ctx.client.clone(), ns);
    let list = clusters.list(&ListParams::default()).await?;
    list.items.into_iter().next().ok_or_else(|| {
        BackupError::Failed(format!("no CheCluster found in namespace {}", ns))
    })
}

/// Persist `spec.triggerNow = false` with a bounded retry
async fn reset_trigger(ctx: &Context, ns: &str, name: &str) -> Result<()> {
    let api: Api<CheClusterBackup> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({ "spec": { "triggerNow": false } });

    let mut attempt = 0;
    loop {
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if attempt + 1 < TRIGGER_RESET_ATTEMPTS => {
                warn!(attempt, "Failed to reset triggerNow, retrying: {}", e);
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
}

/// Error policy for the backup controller
pub fn error_policy(backup: Arc<CheClusterBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    let backoff = BackoffConfig::default();
    let delay = backoff.delay_for_error(error, 0);

    if let Some(ref health) = ctx.health {
        health.metrics.record_error("checlusterbackup");
    }
    warn!(
        "Backup reconcile error for {}: {}, requeuing in {:?}",
        backup.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
