use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use tokio::sync::Mutex;

use crate::health::HealthState;
use crate::platform::{ImageDefaults, Infrastructure};

/// Per-CR progress of a restore attempt, so a reconcile re-entry after a
/// crash skips the stages that already completed within the same
/// trigger cycle
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreProgress {
    pub downloaded: bool,
    pub restored: bool,
}

/// Shared context for all three controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Cluster flavor detected at startup
    pub infrastructure: Infrastructure,
    /// Per-component image defaults read at startup
    pub images: ImageDefaults,
    /// Health/metrics state, when the health server runs
    pub health: Option<Arc<HealthState>>,
    /// Guards the fixed staging directories: one backup or restore at a time
    pub staging_lock: Mutex<()>,
    /// In-memory restore stage cache, keyed by `namespace/name`
    pub restore_progress: Mutex<HashMap<String, RestoreProgress>>,
}

impl Context {
    pub fn new(
        client: Client,
        infrastructure: Infrastructure,
        images: ImageDefaults,
        health: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            infrastructure,
            images,
            health,
            staging_lock: Mutex::new(()),
            restore_progress: Mutex::new(HashMap::new()),
        }
    }
}
