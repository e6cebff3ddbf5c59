//! Reconciliation logic for CheClusterRestore resources.
//!
//! A restore runs in two stages, Downloading then Restoring, tracked both
//! in the CR status and in an in-memory progress cache so a reconcile
//! re-entry after a crash does not repeat a completed stage within the
//! same trigger cycle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::backup::collect::prepare_staging_dir;
use crate::backup::restore::restore_backup_data;
use crate::backup::{resolve_backup_server, RESTORE_STAGING_DIR};
use crate::controller::context::{Context, RestoreProgress};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::state_machine::{next_restore_stage, RestoreEvent};
use crate::controller::status::update_restore_status;
use crate::crd::{CheClusterBackup, CheClusterRestore, RestoreStage};

/// Main reconciliation function
#[instrument(skip(restore, ctx), fields(name = %restore.name_any(), namespace = restore.namespace().unwrap_or_default()))]
pub async fn reconcile_restore(
    restore: Arc<CheClusterRestore>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let ns = restore.namespace().unwrap_or_default();
    let name = restore.name_any();
    let progress_key = format!("{}/{}", ns, name);

    if !restore.spec.trigger_now {
        // A finished cycle leaves no cached progress behind
        ctx.restore_progress.lock().await.remove(&progress_key);
        return Ok(Action::await_change());
    }

    let current_stage = restore.status.as_ref().map(|s| s.stage).unwrap_or_default();
    if next_restore_stage(current_stage, RestoreEvent::TriggerRequested).is_none() {
        warn!(stage = %current_stage, "Trigger ignored in current stage");
        return Ok(Action::await_change());
    }

    let Ok(_staging_guard) = ctx.staging_lock.try_lock() else {
        info!("Another backup or restore operation is in progress, waiting");
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    match run_restore_attempt(&restore, &ctx, &ns, &progress_key).await {
        Ok(()) => {
            reset_trigger(&ctx, &ns, &name).await?;
            ctx.restore_progress.lock().await.remove(&progress_key);

            let message = format!(
                "Restore successfully finished at {}",
                Utc::now().to_rfc3339()
            );
            update_restore_status(&ctx.client, &ns, &name, RestoreStage::Completed, &message)
                .await?;
            info!("Restore finished");

            if restore.spec.delete_configuration_after_restore {
                let api: Api<CheClusterRestore> = Api::namespaced(ctx.client.clone(), &ns);
                match api.delete(&name, &Default::default()).await {
                    Ok(_) => info!("Deleted restore configuration after successful restore"),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => warn!("Failed to delete restore configuration: {}", e),
                }
            }

            Ok(Action::await_change())
        }
        Err(e) if e.is_retryable() => {
            warn!("Transient restore error, will retry: {}", e);
            Err(e)
        }
        Err(e) => {
            error!("Restore failed: {}", e);
            reset_trigger(&ctx, &ns, &name).await?;
            ctx.restore_progress.lock().await.remove(&progress_key);
            update_restore_status(&ctx.client, &ns, &name, RestoreStage::Failed, &e.to_string())
                .await?;
            Ok(Action::await_change())
        }
    }
}

async fn run_restore_attempt(
    restore: &CheClusterRestore,
    ctx: &Context,
    ns: &str,
    progress_key: &str,
) -> Result<()> {
    let name = restore.name_any();
    let mut spec = restore.spec.clone();

    if spec.copy_backup_server_configuration {
        copy_backup_configuration(ctx, ns, &name, &mut spec).await?;
    }

    let mut server = resolve_backup_server(&spec.servers, spec.server_type)?;
    server.prepare_configuration(&ctx.client, ns).await?;
    server.check_repository().await?;

    let staging = Path::new(RESTORE_STAGING_DIR);
    let progress = ctx
        .restore_progress
        .lock()
        .await
        .get(progress_key)
        .copied()
        .unwrap_or_default();

    if !progress.downloaded {
        update_restore_status(
            &ctx.client,
            ns,
            &name,
            RestoreStage::Downloading,
            "Downloading snapshot from the backup server",
        )
        .await?;

        prepare_staging_dir(staging).await.map_err(Error::BackupError)?;

        if spec.snapshot_id.is_empty() {
            server.download_last_snapshot(staging).await?;
        } else {
            server.download_snapshot(&spec.snapshot_id, staging).await?;
        }

        ctx.restore_progress.lock().await.insert(
            progress_key.to_string(),
            RestoreProgress {
                downloaded: true,
                restored: false,
            },
        );
    }

    if !progress.restored {
        update_restore_status(
            &ctx.client,
            ns,
            &name,
            RestoreStage::Restoring,
            "Applying downloaded data to the cluster",
        )
        .await?;

        // The snapshot tool recreates the absolute source path under the
        // restore target
        let nested = staging.join(
            crate::backup::BACKUP_STAGING_DIR.trim_start_matches('/'),
        );
        let effective_dir = if tokio::fs::try_exists(&nested).await? {
            nested
        } else {
            staging.to_path_buf()
        };

        restore_backup_data(&ctx.client, ns, &effective_dir).await?;

        ctx.restore_progress.lock().await.insert(
            progress_key.to_string(),
            RestoreProgress {
                downloaded: true,
                restored: true,
            },
        );
    }

    // Downloaded dumps hold database contents; clean them up
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!("Failed to clean restore staging directory: {}", e);
    }

    Ok(())
}

/// Copy the backup server configuration from the sole CheClusterBackup in
/// the namespace into the restore spec; more than one is an error the user
/// must resolve
async fn copy_backup_configuration(
    ctx: &Context,
    ns: &str,
    restore_name: &str,
    spec: &mut crate::crd::CheClusterRestoreSpec,
) -> Result<()> {
    let backups: Api<CheClusterBackup> = Api::namespaced(ctx.client.clone(), ns);
    let list = backups.list(&ListParams::default()).await?;

    match list.items.len() {
        0 => Err(Error::PermanentError(format!(
            "no CheClusterBackup found in namespace {} to copy the configuration from",
            ns
        ))),
        1 => {
            let backup = &list.items[0];
            spec.servers = backup.spec.servers.clone();
            spec.server_type = backup.spec.server_type;
            spec.copy_backup_server_configuration = false;

            let api: Api<CheClusterRestore> = Api::namespaced(ctx.client.clone(), ns);
            let patch = json!({ "spec": {
                "servers": &spec.servers,
                "serverType": spec.server_type,
                "copyBackupServerConfiguration": false,
            }});
            api.patch(restore_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            info!(backup = %backup.name_any(), "Copied backup server configuration");
            Ok(())
        }
        n => Err(Error::PermanentError(format!(
            "{} CheClusterBackup resources found in namespace {}, cannot pick one to copy the configuration from",
            n, ns
        ))),
    }
}

/// Persist `spec.triggerNow = false`
async fn reset_trigger(ctx: &Context, ns: &str, name: &str) -> Result<()> {
    let api: Api<CheClusterRestore> = Api::namespaced(ctx.client.clone(), ns);
    let patch = json!({ "spec": { "triggerNow": false } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Error policy for the restore controller
pub fn error_policy(restore: Arc<CheClusterRestore>, error: &Error, ctx: Arc<Context>) -> Action {
    let backoff = BackoffConfig::default();
    let delay = backoff.delay_for_error(error, 0);

    if let Some(ref health) = ctx.health {
        health.metrics.record_error("checlusterrestore");
    }
    warn!(
        "Restore reconcile error for {}: {}, requeuing in {:?}",
        restore.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
