//! Reconciliation logic for CheCluster resources.
//!
//! Runs the ordered sub-reconciler pipeline over a fresh DeployContext on
//! every pass, advances the phase machine from the server deployment's
//! replica counts and manages the CR finalizer.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::status::{
    ConditionBuilder, compute_phase, server_replica_counts, update_che_status,
};
use crate::controller::validation::validate_che_cluster;
use crate::crd::{CheCluster, ChePhase};
use crate::deploy::{pipeline, DeployContext, ReconcileFlow, SERVER_DEPLOYMENT_NAME};

/// Finalizer owned by the top-level reconciler
pub const FINALIZER: &str = "cluster.che.eclipse.org";

/// Requeue interval for steady-state drift detection
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(60);

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile_che_cluster(
    cluster: Arc<CheCluster>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let started = std::time::Instant::now();

    info!("Reconciling CheCluster");

    if cluster.metadata.deletion_timestamp.is_some() {
        return finalize_che_cluster(&cluster, &ctx, &ns).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx, &ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Generation gating: an Active installation whose spec has not changed
    // only needs its status refreshed, not the full pipeline
    if let Some(status) = cluster.status.as_ref()
        && status.che_phase == ChePhase::Active
        && status.observed_generation == cluster.metadata.generation
    {
        let (available, desired, replicas) =
            server_replica_counts(&ctx.client, &ns, SERVER_DEPLOYMENT_NAME).await?;
        let phase = compute_phase(available, desired, replicas);
        if phase == ChePhase::Active {
            return Ok(Action::requeue(STEADY_STATE_REQUEUE));
        }
        info!(phase = %phase, "Installation drifted out of Active, running full pipeline");
    }

    // Invalid specs are terminal until the user edits the CR
    if let Err(e) = validate_che_cluster(&cluster, ctx.infrastructure) {
        warn!("CheCluster spec is invalid: {}", e);
        let mut status = cluster.status.clone().unwrap_or_default();
        status.che_phase = ChePhase::Failed;
        status.message = e.to_string();
        status.observed_generation = cluster.metadata.generation;
        update_che_status(&ctx.client, &ns, &name, &status).await?;
        return Ok(Action::await_change());
    }

    let mut deploy_ctx = DeployContext::new(
        (*cluster).clone(),
        ctx.infrastructure,
        ctx.images.clone(),
        ctx.client.clone(),
    );

    for sub_reconciler in pipeline() {
        match sub_reconciler.reconcile(&mut deploy_ctx).await {
            Ok(ReconcileFlow::Done) => {}
            Ok(ReconcileFlow::Requeue(delay)) => {
                // Persist whatever status the finished layers produced
                if let Some(status) = deploy_ctx.che_cluster.status.as_ref() {
                    update_che_status(&ctx.client, &ns, &name, status).await?;
                }
                info!(
                    layer = sub_reconciler.name(),
                    delay_secs = delay.as_secs(),
                    "Layer not converged yet, requeueing"
                );
                return Ok(Action::requeue(delay));
            }
            Err(e) if !e.is_retryable() => {
                error!(layer = sub_reconciler.name(), "Terminal error: {}", e);
                let mut status = deploy_ctx.che_cluster.status.clone().unwrap_or_default();
                status.che_phase = ChePhase::Failed;
                status.message = e.to_string();
                status.observed_generation = cluster.metadata.generation;
                update_che_status(&ctx.client, &ns, &name, &status).await?;
                return Ok(Action::await_change());
            }
            Err(e) => {
                error!(layer = sub_reconciler.name(), "Reconcile error: {}", e);
                return Err(e);
            }
        }
    }

    let action = finish_pass(&cluster, &ctx, &ns, &name, deploy_ctx).await?;
    if let Some(ref health) = ctx.health {
        health
            .metrics
            .record_reconcile("checluster", started.elapsed().as_secs_f64());
    }
    Ok(action)
}

/// All layers converged; advance the phase machine and publish status
async fn finish_pass(
    cluster: &CheCluster,
    ctx: &Context,
    ns: &str,
    name: &str,
    deploy_ctx: DeployContext,
) -> Result<Action> {
    let (available, desired, replicas) =
        server_replica_counts(&ctx.client, ns, SERVER_DEPLOYMENT_NAME).await?;
    let phase = compute_phase(available, desired, replicas);

    let previous = cluster.status.clone().unwrap_or_default();
    let mut status = deploy_ctx.che_cluster.status.clone().unwrap_or_default();
    status.che_phase = phase.clone();
    status.message = String::new();
    status.observed_generation = cluster.metadata.generation;

    let is_active = phase == ChePhase::Active;
    status.conditions = ConditionBuilder::from_existing(
        previous.conditions.clone(),
        cluster.metadata.generation,
    )
    .ready(
        is_active,
        if is_active { "Available" } else { "Deploying" },
        &format!("server deployment has {}/{} available replicas", available, desired),
    )
    .progressing(
        !is_active,
        if is_active { "Stable" } else { "Deploying" },
        "installation is converging",
    )
    .build();

    let che_url = deploy_ctx.che_url();
    if phase == ChePhase::Active && !che_url.is_empty() {
        status.che_url = che_url;
    }

    let server_image = ctx.images.che_server_image(&deploy_ctx.che_cluster);
    status.che_version = server_image
        .rsplit_once(':')
        .map(|(_, tag)| tag.to_string())
        .unwrap_or_default();

    if status.che_url != previous.che_url && !status.che_url.is_empty() {
        info!(url = %status.che_url, "Che is available");
    }

    if let Some(ref health) = ctx.health {
        health.metrics.record_phase(&phase.to_string());
    }

    update_che_status(&ctx.client, ns, name, &status).await?;

    match phase {
        ChePhase::Active => Ok(Action::requeue(STEADY_STATE_REQUEUE)),
        // Rollouts and cold starts settle on their own; check back soon
        _ => Ok(Action::requeue(Duration::from_secs(10))),
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<CheCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let backoff = BackoffConfig::default();
    let delay = backoff.delay_for_error(error, 0);

    if let Some(ref health) = ctx.health {
        health.metrics.record_error("checluster");
    }

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Handle CR deletion: finalize the sub-reconcilers in reverse order, then
/// release the finalizer
async fn finalize_che_cluster(
    cluster: &CheCluster,
    ctx: &Context,
    ns: &str,
) -> Result<Action> {
    let name = cluster.name_any();
    info!("Finalizing CheCluster {}", name);

    let deploy_ctx = DeployContext::new(
        cluster.clone(),
        ctx.infrastructure,
        ctx.images.clone(),
        ctx.client.clone(),
    );

    let mut all_done = true;
    for sub_reconciler in pipeline().iter().rev() {
        match sub_reconciler.finalize(&deploy_ctx).await {
            Ok(done) => all_done &= done,
            Err(e) => {
                warn!(
                    layer = sub_reconciler.name(),
                    "Finalize failed, will retry: {}",
                    e
                );
                all_done = false;
            }
        }
    }

    if !all_done {
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    // Everything cluster-scoped is gone; release the finalizers we own.
    // Finalizers added by other controllers are left in place.
    let api: Api<CheCluster> = Api::namespaced(ctx.client.clone(), ns);
    let current = api.get_opt(&name).await?;
    if let Some(current) = current {
        let remaining: Vec<String> = current
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER && !f.contains(".crb.finalizers."))
            .cloned()
            .collect();
        let patch = json!({ "metadata": { "finalizers": remaining } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Released finalizers of {}", name);
    }

    Ok(Action::await_change())
}

/// Check if the top-level finalizer is present
fn has_finalizer(cluster: &CheCluster) -> bool {
    cluster
        .finalizers()
        .iter()
        .any(|f| f == FINALIZER)
}

/// Add the top-level finalizer, keeping any finalizers already present
async fn add_finalizer(cluster: &CheCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<CheCluster> = Api::namespaced(ctx.client.clone(), ns);
    let name = cluster.name_any();

    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}
