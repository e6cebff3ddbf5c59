use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::api::ListParams;
use kube::{Api, Client};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

use che_operator::health::{HealthState, run_health_server};
use che_operator::platform::{ImageDefaults, Infrastructure};
use che_operator::{
    CheCluster, CheClusterBackup, CheClusterRestore, Context, run_backup_controller,
    run_che_controller, run_restore_controller,
};

/// Lease configuration
const LEASE_NAME: &str = "che-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

/// Initialization failures; the process exits non-zero on any of these
#[derive(Error, Debug)]
enum StartupError {
    #[error("Failed to connect to the cluster: {0}")]
    ClientError(#[source] kube::Error),

    #[error("CRD for {kind} is not installed: {source}")]
    CrdMissing {
        kind: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("Infrastructure detection failed: {0}")]
    DetectionError(#[source] kube::Error),
}

/// Everything startup has to produce before the controllers may run
struct ReadyOperator {
    client: Client,
    infrastructure: Infrastructure,
    images: ImageDefaults,
    watch_namespace: Option<String>,
}

/// Probe the cluster and return a ready-to-run configuration. This is the
/// only validation allowed to end the process; reconcilers never do.
async fn init() -> Result<ReadyOperator, StartupError> {
    let client = Client::try_default()
        .await
        .map_err(StartupError::ClientError)?;
    info!("Connected to Kubernetes cluster");

    // Missing CRDs are an installation error; fail fast
    let clusters: Api<CheCluster> = Api::all(client.clone());
    clusters
        .list(&ListParams::default().limit(1))
        .await
        .map_err(|e| StartupError::CrdMissing {
            kind: "CheCluster",
            source: e,
        })?;
    let backups: Api<CheClusterBackup> = Api::all(client.clone());
    backups
        .list(&ListParams::default().limit(1))
        .await
        .map_err(|e| StartupError::CrdMissing {
            kind: "CheClusterBackup",
            source: e,
        })?;
    let restores: Api<CheClusterRestore> = Api::all(client.clone());
    restores
        .list(&ListParams::default().limit(1))
        .await
        .map_err(|e| StartupError::CrdMissing {
            kind: "CheClusterRestore",
            source: e,
        })?;

    let infrastructure = Infrastructure::detect(&client)
        .await
        .map_err(StartupError::DetectionError)?;

    let images = ImageDefaults::from_env();

    let watch_namespace = std::env::var("WATCH_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty());

    Ok(ReadyOperator {
        client,
        infrastructure,
        images,
        watch_namespace,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("che_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting che-operator");

    let ready = match init().await {
        Ok(ready) => ready,
        Err(e) => {
            error!("Initialization failed: {}", e);
            return Err(e.into());
        }
    };

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let health_state = Arc::new(HealthState::new());
    let is_leader = Arc::new(AtomicBool::new(false));

    // Start health server immediately (probes should work even as non-leader)
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Create leader election lease lock
    let lease_lock = LeaseLock::new(
        ready.client.clone(),
        &namespace,
        LeaseLockParams {
            holder_id: pod_name.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    // Acquire leadership before starting the controllers; duplicate writers
    // would fight over objects and the shared staging directories
    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) => {
                if result.acquired_lease {
                    info!("Acquired leadership");
                    is_leader.store(true, Ordering::SeqCst);
                    break;
                } else {
                    info!("Another instance is leader, waiting...");
                }
            }
            Err(e) => {
                warn!("Failed to acquire lease: {}, retrying...", e);
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    // Start lease renewal background task
    let lease_renewal_handle = {
        let is_leader = is_leader.clone();
        let lease_lock = LeaseLock::new(
            ready.client.clone(),
            &namespace,
            LeaseLockParams {
                holder_id: pod_name,
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) => {
                        if !result.acquired_lease {
                            error!("Lost leadership! Shutting down...");
                            is_leader.store(false, Ordering::SeqCst);
                            // Exit so Kubernetes restarts us and we re-enter election
                            std::process::exit(1);
                        }
                    }
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        is_leader.store(false, Ordering::SeqCst);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    let context = Arc::new(Context::new(
        ready.client.clone(),
        ready.infrastructure,
        ready.images.clone(),
        Some(health_state.clone()),
    ));

    match &ready.watch_namespace {
        Some(ns) => info!("Watching Che resources in namespace {}", ns),
        None => info!("Watching Che resources cluster-wide"),
    }

    let che_handle = {
        let ctx = context.clone();
        let ns = ready.watch_namespace.clone();
        tokio::spawn(async move {
            run_che_controller(ctx, ns.as_deref()).await;
        })
    };

    let backup_handle = {
        let ctx = context.clone();
        let ns = ready.watch_namespace.clone();
        tokio::spawn(async move {
            run_backup_controller(ctx, ns.as_deref()).await;
        })
    };

    let restore_handle = {
        let ctx = context.clone();
        let ns = ready.watch_namespace.clone();
        tokio::spawn(async move {
            run_restore_controller(ctx, ns.as_deref()).await;
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = che_handle => {
            if let Err(e) = result {
                error!("CheCluster controller task panicked: {}", e);
            }
        }
        result = backup_handle => {
            if let Err(e) = result {
                error!("Backup controller task panicked: {}", e);
            }
        }
        result = restore_handle => {
            if let Err(e) = result {
                error!("Restore controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Lease renewal task only exits via process::exit() or panic
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
