//! Status management for the three CR kinds.

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;

use crate::controller::error::Result;
use crate::crd::{
    BackupState, CheCluster, CheClusterBackup, CheClusterBackupStatus, CheClusterRestore,
    CheClusterRestoreStatus, CheClusterStatus, ChePhase, Condition, RestoreStage,
};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Installation is serving at its public URL
    pub const READY: &str = "Ready";
    /// Installation is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    /// The transition time only moves when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        let status = if is_ready {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::READY, status, reason, message)
    }

    /// Set the Progressing condition
    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        let status = if is_progressing {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::PROGRESSING, status, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Derive the installation phase from the server deployment's replica
/// counts
pub fn compute_phase(available: i32, desired: i32, replicas: i32) -> ChePhase {
    if available == 0 {
        ChePhase::Inactive
    } else if replicas > desired {
        // Surge pods from a rollout in flight
        ChePhase::RollingUpdate
    } else if available >= desired {
        ChePhase::Active
    } else {
        ChePhase::RollingUpdate
    }
}

/// Read the server deployment's replica counts `(available, desired,
/// replicas)`; all zero when the deployment does not exist yet
pub async fn server_replica_counts(
    client: &Client,
    namespace: &str,
    deployment_name: &str,
) -> Result<(i32, i32, i32)> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    match deployments.get_opt(deployment_name).await? {
        Some(deployment) => {
            let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let status = deployment.status.unwrap_or_default();
            Ok((
                status.available_replicas.unwrap_or(0),
                desired,
                status.replicas.unwrap_or(0),
            ))
        }
        None => Ok((0, 0, 0)),
    }
}

/// Patch the CheCluster status subresource
pub async fn update_che_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &CheClusterStatus,
) -> Result<()> {
    let api: Api<CheCluster> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Patch the CheClusterBackup status subresource
pub async fn update_backup_status(
    client: &Client,
    namespace: &str,
    name: &str,
    state: BackupState,
    snapshot_id: &str,
    message: &str,
) -> Result<()> {
    let api: Api<CheClusterBackup> = Api::namespaced(client.clone(), namespace);
    let status = CheClusterBackupStatus {
        state,
        snapshot_id: snapshot_id.to_string(),
        message: message.to_string(),
    };
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Patch the CheClusterRestore status subresource
pub async fn update_restore_status(
    client: &Client,
    namespace: &str,
    name: &str,
    stage: RestoreStage,
    message: &str,
) -> Result<()> {
    let api: Api<CheClusterRestore> = Api::namespaced(client.clone(), namespace);
    let status = CheClusterRestoreStatus {
        stage,
        message: message.to_string(),
    };
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_inactive_without_replicas() {
        assert_eq!(compute_phase(0, 1, 0), ChePhase::Inactive);
        assert_eq!(compute_phase(0, 1, 1), ChePhase::Inactive);
    }

    #[test]
    fn test_phase_active_when_fully_available() {
        assert_eq!(compute_phase(1, 1, 1), ChePhase::Active);
    }

    #[test]
    fn test_phase_rolling_update_with_surge_pods() {
        assert_eq!(compute_phase(1, 1, 2), ChePhase::RollingUpdate);
    }

    #[test]
    fn test_phase_rolling_update_while_degraded() {
        assert_eq!(compute_phase(1, 2, 2), ChePhase::RollingUpdate);
    }

    #[test]
    fn test_condition_builder_adds_and_updates() {
        let conditions = ConditionBuilder::from_existing(Vec::new(), Some(1))
            .ready(false, "Deploying", "server rollout in progress")
            .progressing(true, "Deploying", "server rollout in progress")
            .build();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "Ready");
        assert_eq!(conditions[0].status, "False");

        let first_transition = conditions[0].last_transition_time.clone();
        let updated = ConditionBuilder::from_existing(conditions, Some(2))
            .ready(false, "Deploying", "still rolling")
            .build();
        // Status unchanged: transition time stays put
        assert_eq!(updated[0].last_transition_time, first_transition);
        assert_eq!(updated[0].message, "still rolling");
        assert_eq!(updated[0].observed_generation, Some(2));
    }

    #[test]
    fn test_condition_transition_time_moves_on_flip() {
        let conditions = ConditionBuilder::from_existing(Vec::new(), Some(1))
            .ready(false, "Deploying", "starting")
            .build();
        let updated = ConditionBuilder::from_existing(conditions, Some(1))
            .ready(true, "Available", "serving")
            .build();
        assert_eq!(updated[0].status, "True");
        assert_eq!(updated[0].reason, "Available");
    }
}
