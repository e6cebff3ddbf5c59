//! Command execution inside the managed database pod.
//!
//! Database dumps and restores run `pg_dump`/`pg_restore` inside the
//! Postgres pod through the Kubernetes exec API, streaming dump bytes over
//! stdout/stdin so nothing is persisted inside the pod between steps.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::backup::BackupError;

/// Label selector matching the pods of the managed Postgres deployment
const DATABASE_POD_SELECTOR: &str =
    "app.kubernetes.io/component=postgres,app.kubernetes.io/part-of=che.eclipse.org";

/// Container name inside the Postgres pod
const DATABASE_CONTAINER: &str = "postgres";

/// Locate the Postgres pod of the managed deployment
pub async fn find_database_pod(client: &Client, namespace: &str) -> Result<String, BackupError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod_list = pods
        .list(&ListParams::default().labels(DATABASE_POD_SELECTOR))
        .await?;

    pod_list
        .items
        .into_iter()
        .find_map(|p| p.metadata.name)
        .ok_or_else(|| BackupError::DatabasePodNotFound(namespace.to_string()))
}

/// Execute a shell script in the Postgres pod, optionally streaming bytes to
/// its stdin, and return the raw stdout bytes.
pub async fn exec_in_database_pod(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    script: &str,
    stdin_data: Option<&[u8]>,
) -> Result<Vec<u8>, BackupError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let attach_params = AttachParams {
        container: Some(DATABASE_CONTAINER.to_string()),
        stdin: true,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    };

    let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];

    debug!(pod = %pod_name, namespace = %namespace, "Executing command in database pod");

    let mut attached = pods.exec(pod_name, command, &attach_params).await?;

    if let Some(mut stdin) = attached.stdin() {
        if let Some(data) = stdin_data {
            stdin
                .write_all(data)
                .await
                .map_err(|e| BackupError::PodExecFailed(format!("stdin write failed: {}", e)))?;
        }
        stdin
            .shutdown()
            .await
            .map_err(|e| BackupError::PodExecFailed(format!("stdin close failed: {}", e)))?;
    }

    let mut stdout = attached
        .stdout()
        .ok_or_else(|| BackupError::PodExecFailed("failed to get stdout from exec".to_string()))?;
    let mut stderr = attached
        .stderr()
        .ok_or_else(|| BackupError::PodExecFailed("failed to get stderr from exec".to_string()))?;

    let mut stdout_output = Vec::new();
    let mut stderr_output = Vec::new();
    stdout
        .read_to_end(&mut stdout_output)
        .await
        .map_err(|e| BackupError::PodExecFailed(format!("stdout read failed: {}", e)))?;
    stderr
        .read_to_end(&mut stderr_output)
        .await
        .map_err(|e| BackupError::PodExecFailed(format!("stderr read failed: {}", e)))?;

    let status = attached
        .take_status()
        .ok_or_else(|| BackupError::PodExecFailed("failed to get status from exec".to_string()))?;

    if let Some(status) = status.await
        && status.status != Some("Success".to_string())
    {
        let stderr_text = String::from_utf8_lossy(&stderr_output);
        let message = if stderr_text.trim().is_empty() {
            format!("command failed with status: {:?}", status)
        } else {
            stderr_text.trim().to_string()
        };
        return Err(BackupError::PodExecFailed(message));
    }

    Ok(stdout_output)
}
