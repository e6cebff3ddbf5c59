//! Thin wrapper around the external `restic` binary.
//!
//! Every operation is a subprocess invocation with the repository URL and
//! credentials supplied through the environment. The repository password is
//! passed via `RESTIC_PASSWORD_COMMAND` so it never touches disk.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::backup::BackupError;

/// Wall-clock bound for snapshot uploads and repository maintenance
pub const BACKUP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Wall-clock bound for snapshot downloads
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Identifier and size summary of a stored snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotStat {
    /// Opaque hex identifier assigned by the snapshot tool
    pub id: String,
    /// Size summary line from the tool output, when present
    pub info: String,
}

/// Client for one repository, holding the URL and credential environment
#[derive(Clone, Debug)]
pub struct ResticClient {
    repo_url: String,
    repo_password: String,
    extra_env: Vec<(String, String)>,
    extra_options: Vec<String>,
}

impl ResticClient {
    pub fn new(repo_url: impl Into<String>, repo_password: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            repo_password: repo_password.into(),
            extra_env: Vec::new(),
            extra_options: Vec::new(),
        }
    }

    /// Append credential environment (S3 keys)
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((name.into(), value.into()));
        self
    }

    /// Append a `-o key=value` extended option (e.g. a custom sftp command)
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    /// Initialize the repository. An already-initialized repository is
    /// success: the operation is idempotent by contract.
    pub async fn init_repository(&self) -> Result<(), BackupError> {
        match self.run(&["init"], BACKUP_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(BackupError::ResticFailed(message))
                if message.contains("already initialized") || message.contains("already exists") =>
            {
                debug!(repo = %self.repo_url, "Repository already initialized");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Probe the repository. `Ok(false)` means the repository does not exist;
    /// transport and auth failures are errors so the caller does not
    /// mistakenly initialize over them.
    pub async fn is_repository_exist(&self) -> Result<bool, BackupError> {
        match self.run(&["snapshots", "latest"], BACKUP_TIMEOUT).await {
            Ok(_) => Ok(true),
            Err(BackupError::ResticFailed(message)) => {
                if message.contains("Is there a repository at the following location")
                    || message.contains("no snapshot found")
                    || message.contains("does not exist")
                {
                    Ok(false)
                } else {
                    Err(BackupError::RepositoryUnreachable(message))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Validate repository integrity and, implicitly, the credentials
    pub async fn check_repository(&self) -> Result<(), BackupError> {
        self.run(&["check"], BACKUP_TIMEOUT).await.map(|_| ())
    }

    /// Upload the staging directory as a new snapshot
    pub async fn send_snapshot(&self, path: &Path) -> Result<SnapshotStat, BackupError> {
        let path_str = path.to_string_lossy();
        let output = self.run(&["backup", &path_str], BACKUP_TIMEOUT).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_snapshot_stat(&stdout).ok_or_else(|| {
            BackupError::ResticFailed(format!(
                "backup finished but no snapshot id found in output: {}",
                stdout.trim()
            ))
        })
    }

    /// Download a snapshot into the given directory, creating it if needed
    pub async fn download_snapshot(&self, id: &str, path: &Path) -> Result<(), BackupError> {
        tokio::fs::create_dir_all(path).await?;
        let path_str = path.to_string_lossy();
        self.run(&["restore", id, "--target", &path_str], RESTORE_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Download the most recent snapshot
    pub async fn download_last_snapshot(&self, path: &Path) -> Result<(), BackupError> {
        self.download_snapshot("latest", path).await
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, BackupError> {
        let mut command = Command::new("restic");
        command.arg("--repo").arg(&self.repo_url);
        for option in &self.extra_options {
            command.arg("-o").arg(option);
        }
        command
            .args(args)
            .env(
                "RESTIC_PASSWORD_COMMAND",
                format!("echo '{}'", self.repo_password),
            )
            .kill_on_drop(true);
        for (name, value) in &self.extra_env {
            command.env(name, value);
        }

        debug!(repo = %self.repo_url, args = ?args, "Running snapshot tool");

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(repo = %self.repo_url, args = ?args, "Snapshot tool timed out, killed");
                return Err(BackupError::ResticTimeout(timeout));
            }
        };

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(BackupError::ResticFailed(message))
        }
    }
}

/// Parse `snapshot <hex> saved` plus the preceding size summary from the
/// backup output
fn parse_snapshot_stat(stdout: &str) -> Option<SnapshotStat> {
    let mut info = String::new();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("snapshot ")
            && let Some(id) = rest.strip_suffix(" saved")
            && !id.is_empty()
            && id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Some(SnapshotStat {
                id: id.to_string(),
                info,
            });
        }
        if line.starts_with("processed ") || line.starts_with("Added to the repo") {
            if !info.is_empty() {
                info.push_str("; ");
            }
            info.push_str(line);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_id() {
        let output = "\
repository 7e2005a7 opened successfully, password is correct\n\
processed 23 files, 1.634 MiB in 0:00\n\
snapshot 0bda98f0 saved\n";
        let stat = parse_snapshot_stat(output).unwrap();
        assert_eq!(stat.id, "0bda98f0");
        assert!(stat.info.contains("processed 23 files"));
    }

    #[test]
    fn test_parse_no_snapshot_line() {
        assert!(parse_snapshot_stat("repository opened successfully\n").is_none());
    }

    #[test]
    fn test_parse_rejects_non_hex_id() {
        assert!(parse_snapshot_stat("snapshot not-an-id saved\n").is_none());
    }
}
