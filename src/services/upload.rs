/// Off-site upload worker. Completed segments arrive on a single-consumer
/// queue; each is pushed through the configured upload command with
/// `{file}` / `{channel}` / `{filename}` placeholders substituted.
///
/// Per-file upload state lives in an adjacent JSON sidecar
/// (`<segment>.upload.json`) so that retention pruning can exempt files
/// that are still pending or in flight.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

use crate::config::RecordConfig;
use crate::services::manager::BridgeState;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    InProgress,
    Uploaded,
    Failed,
}

impl UploadState {
    /// Files in these states must survive retention pruning.
    pub fn exempt_from_pruning(self) -> bool {
        matches!(self, UploadState::Pending | UploadState::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::InProgress => "in_progress",
            UploadState::Uploaded => "uploaded",
            UploadState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub state: UploadState,
    #[serde(default)]
    pub attempts: u32,
}

pub fn sidecar_path(segment: &Path) -> PathBuf {
    let mut name = segment.file_name().unwrap_or_default().to_os_string();
    name.push(".upload.json");
    segment.with_file_name(name)
}

pub fn read_sidecar(segment: &Path) -> Option<Sidecar> {
    let raw = std::fs::read_to_string(sidecar_path(segment)).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn write_sidecar(segment: &Path, sidecar: &Sidecar) -> std::io::Result<()> {
    let raw = serde_json::to_string(sidecar).expect("sidecar serializes");
    std::fs::write(sidecar_path(segment), raw)
}

pub fn remove_sidecar(segment: &Path) {
    let _ = std::fs::remove_file(sidecar_path(segment));
}

/// A completed segment handed off by the recorder.
#[derive(Debug)]
pub struct SegmentJob {
    pub path: PathBuf,
    /// Channel directory name, e.g. `ch0`.
    pub channel: String,
}

pub async fn run(cfg: RecordConfig, state: Arc<BridgeState>, mut rx: mpsc::Receiver<SegmentJob>) {
    let Some(command) = cfg.upload_command.clone() else {
        return;
    };
    info!("upload worker ready");

    while let Some(job) = rx.recv().await {
        state.update_recorder(|r| r.upload_queue_len = r.upload_queue_len.saturating_sub(1));
        if !job.path.exists() {
            remove_sidecar(&job.path);
            continue;
        }

        let mut attempts = read_sidecar(&job.path).map(|s| s.attempts).unwrap_or(0);
        let mut uploaded = false;
        while attempts < MAX_ATTEMPTS {
            attempts += 1;
            let _ = write_sidecar(
                &job.path,
                &Sidecar {
                    state: UploadState::InProgress,
                    attempts,
                },
            );
            match upload_one(&command, &job).await {
                Ok(()) => {
                    uploaded = true;
                    break;
                }
                Err(e) => {
                    error!(
                        file = %job.path.display(),
                        attempts, "upload failed: {e:#}"
                    );
                    if attempts < MAX_ATTEMPTS {
                        sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        if uploaded {
            info!(file = %job.path.display(), "uploaded");
            let _ = write_sidecar(
                &job.path,
                &Sidecar {
                    state: UploadState::Uploaded,
                    attempts,
                },
            );
            if cfg.upload_delete_local {
                if let Err(e) = std::fs::remove_file(&job.path) {
                    warn!(file = %job.path.display(), "delete after upload failed: {e}");
                } else {
                    remove_sidecar(&job.path);
                    info!(file = %job.path.display(), "deleted local copy after upload");
                }
            }
        } else {
            warn!(file = %job.path.display(), "giving up after {MAX_ATTEMPTS} attempts");
            let _ = write_sidecar(
                &job.path,
                &Sidecar {
                    state: UploadState::Failed,
                    attempts,
                },
            );
            state.update_recorder(|r| {
                r.last_error = Some(format!("upload failed: {}", job.path.display()))
            });
        }
    }
}

async fn upload_one(command: &str, job: &SegmentJob) -> anyhow::Result<()> {
    let filename = job
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cmd = command
        .replace("{file}", &job.path.to_string_lossy())
        .replace("{channel}", &job.channel)
        .replace("{filename}", &filename);

    info!(%cmd, "running upload command");
    let status = timeout(
        UPLOAD_TIMEOUT,
        Command::new("sh").arg("-c").arg(&cmd).status(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("upload command timed out"))??;

    if !status.success() {
        anyhow::bail!("upload command exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("20260801T120000Z.mp4");
        std::fs::write(&segment, b"x").unwrap();

        assert!(read_sidecar(&segment).is_none());
        write_sidecar(
            &segment,
            &Sidecar {
                state: UploadState::InProgress,
                attempts: 2,
            },
        )
        .unwrap();

        let sc = read_sidecar(&segment).unwrap();
        assert_eq!(sc.state, UploadState::InProgress);
        assert_eq!(sc.attempts, 2);
        assert_eq!(
            sidecar_path(&segment).file_name().unwrap(),
            "20260801T120000Z.mp4.upload.json"
        );

        remove_sidecar(&segment);
        assert!(read_sidecar(&segment).is_none());
    }

    #[test]
    fn pruning_exemptions() {
        assert!(UploadState::Pending.exempt_from_pruning());
        assert!(UploadState::InProgress.exempt_from_pruning());
        assert!(!UploadState::Uploaded.exempt_from_pruning());
        assert!(!UploadState::Failed.exempt_from_pruning());
    }

    #[tokio::test]
    async fn upload_command_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("seg.mp4");
        std::fs::write(&segment, b"x").unwrap();
        let marker = dir.path().join("marker");

        let job = SegmentJob {
            path: segment.clone(),
            channel: "ch0".to_string(),
        };
        let cmd = format!("echo {{channel}}/{{filename}} > {}", marker.display());
        upload_one(&cmd, &job).await.unwrap();

        let out = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(out.trim(), "ch0/seg.mp4");
    }

    #[tokio::test]
    async fn upload_failure_is_reported() {
        let job = SegmentJob {
            path: PathBuf::from("/nonexistent/seg.mp4"),
            channel: "ch0".to_string(),
        };
        assert!(upload_one("exit 3", &job).await.is_err());
    }
}
