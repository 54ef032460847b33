/// mediamtx child supervisor. Writes the generated config (per-path
/// on-demand hooks pointing back at our HTTP API) and restarts the server
/// whenever it exits.
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::protocol::StreamType;
use crate::services::ingest::{next_backoff, shutdown_child};

const RESTART_BACKOFF_MIN: std::time::Duration = std::time::Duration::from_secs(3);
/// Grace period before mediamtx fires the stop hook after the last
/// subscriber leaves.
const CLOSE_AFTER: &str = "10s";

/// Render the mediamtx configuration for our channel paths.
pub fn render_config(cfg: &BridgeConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!("rtspAddress: :{}\n", cfg.rtsp_port));
    out.push_str("paths:\n");
    for channel in 0..cfg.channels {
        for stream_type in [StreamType::Main, StreamType::Sub] {
            let path = format!("ch{channel}{}", stream_type.path_suffix());
            let hook_base = format!(
                "http://127.0.0.1:{}/api/hooks/{path}",
                cfg.web_port
            );
            out.push_str(&format!("  {path}:\n"));
            out.push_str(&format!(
                "    runOnDemand: curl -s -X POST {hook_base}/start\n"
            ));
            out.push_str("    runOnDemandRestart: no\n");
            out.push_str(&format!("    runOnDemandCloseAfter: {CLOSE_AFTER}\n"));
            out.push_str(&format!(
                "    runOnUnDemand: curl -s -X POST {hook_base}/stop\n"
            ));
        }
    }
    out
}

fn config_path() -> PathBuf {
    std::env::temp_dir().join("hieasy-bridge-mediamtx.yml")
}

pub fn write_config(cfg: &BridgeConfig) -> Result<PathBuf> {
    let path = config_path();
    std::fs::write(&path, render_config(cfg))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Run mediamtx, restarting on exit with the usual backoff.
pub async fn supervise(cfg: BridgeConfig, mut shutdown: watch::Receiver<bool>) {
    let conf = match write_config(&cfg) {
        Ok(path) => path,
        Err(e) => {
            error!("cannot write RTSP server config: {e:#}");
            return;
        }
    };

    let mut backoff = RESTART_BACKOFF_MIN;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let child = Command::new(&cfg.rtsp_bin)
            .arg(&conf)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => {
                info!(bin = %cfg.rtsp_bin, conf = %conf.display(), "RTSP server started");
                child
            }
            Err(e) => {
                error!(bin = %cfg.rtsp_bin, "cannot start RTSP server: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        let started = std::time::Instant::now();
        tokio::select! {
            status = child.wait() => {
                warn!(?status, "RTSP server exited, restarting");
                if started.elapsed() >= std::time::Duration::from_secs(60) {
                    backoff = RESTART_BACKOFF_MIN;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
                backoff = next_backoff(backoff);
            }
            _ = shutdown.changed() => {
                shutdown_child(&mut child, "mediamtx").await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn config_covers_all_paths_with_hooks() {
        let cfg = test_config();
        let rendered = render_config(&cfg);
        assert!(rendered.starts_with("rtspAddress: :8554\n"));
        for path in ["ch0", "ch0sub", "ch1", "ch1sub"] {
            assert!(rendered.contains(&format!("  {path}:\n")), "missing {path}");
            assert!(rendered
                .contains(&format!("http://127.0.0.1:8080/api/hooks/{path}/start")));
            assert!(rendered
                .contains(&format!("http://127.0.0.1:8080/api/hooks/{path}/stop")));
        }
        assert!(!rendered.contains("ch2"));
    }
}
