/// On-demand ingest supervisors: one per RTSP path, driven by the
/// mediamtx runOnDemand/runOnUnDemand hooks.
///
/// While a path is demanded the supervisor runs a feeder child piped into
/// an ffmpeg publisher. Either child dying tears the pipeline down;
/// restarts back off exponentially, and repeated establishment failures
/// quarantine the channel for five minutes.
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::protocol::StreamType;
use crate::services::manager::BridgeState;

const BACKOFF_MIN: Duration = Duration::from_secs(3);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Uptime that counts as a healthy run and resets the backoff.
const BACKOFF_RESET_UPTIME: Duration = Duration::from_secs(60);
const QUARANTINE_THRESHOLD: u32 = 3;
const QUARANTINE: Duration = Duration::from_secs(300);
pub const CHILD_STOP_GRACE: Duration = Duration::from_secs(5);

/// One RTSP path: `ch<N>` (main) or `ch<N>sub`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSpec {
    pub channel: u8,
    pub stream_type: StreamType,
}

impl PathSpec {
    pub fn parse(path: &str, channel_count: u8) -> Option<Self> {
        let rest = path.strip_prefix("ch")?;
        let (digits, stream_type) = match rest.strip_suffix("sub") {
            Some(digits) => (digits, StreamType::Sub),
            None => (rest, StreamType::Main),
        };
        let channel: u8 = digits.parse().ok()?;
        (channel < channel_count).then_some(PathSpec {
            channel,
            stream_type,
        })
    }

    pub fn name(&self) -> String {
        format!("ch{}{}", self.channel, self.stream_type.path_suffix())
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_MAX)
}

/// Owns the demand flags for every path; the HTTP hook handlers toggle
/// them. Toggling is idempotent, so overlapping hooks are harmless.
pub struct IngestManager {
    demands: HashMap<String, watch::Sender<bool>>,
}

impl IngestManager {
    pub fn new(cfg: &BridgeConfig, state: Arc<BridgeState>) -> Self {
        let mut demands = HashMap::new();
        for channel in 0..cfg.channels {
            for stream_type in [StreamType::Main, StreamType::Sub] {
                let spec = PathSpec {
                    channel,
                    stream_type,
                };
                let (tx, rx) = watch::channel(false);
                tokio::spawn(supervise(spec, cfg.clone(), state.clone(), rx));
                demands.insert(spec.name(), tx);
            }
        }
        IngestManager { demands }
    }

    /// Demand hook: returns false for unknown paths.
    pub fn start(&self, path: &str) -> bool {
        match self.demands.get(path) {
            Some(tx) => {
                info!(path, "ingest demanded");
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn stop(&self, path: &str) -> bool {
        match self.demands.get(path) {
            Some(tx) => {
                info!(path, "ingest released");
                tx.send_replace(false);
                true
            }
            None => false,
        }
    }

    pub fn known_path(&self, path: &str) -> bool {
        self.demands.contains_key(path)
    }
}

enum PipelineEnd {
    /// Stop hook fired; clean teardown.
    Undemanded,
    /// A child died or never came up while the path was still demanded.
    Failed { establishment: bool },
}

async fn supervise(
    spec: PathSpec,
    cfg: BridgeConfig,
    state: Arc<BridgeState>,
    mut demand: watch::Receiver<bool>,
) {
    let path = spec.name();
    let mut backoff = BACKOFF_MIN;
    let mut failures = 0u32;
    let mut quarantined_until: Option<Instant> = None;

    loop {
        // Park until the start hook fires.
        while !*demand.borrow() {
            if demand.changed().await.is_err() {
                return;
            }
        }

        if let Some(until) = quarantined_until {
            let now = Instant::now();
            if now < until {
                tokio::select! {
                    _ = tokio::time::sleep(until - now) => {}
                    _ = wait_undemanded(&mut demand) => continue,
                }
            }
            info!(path, "quarantine over");
            quarantined_until = None;
        }

        let started = Instant::now();
        let end = match run_pipeline(&spec, &cfg, &state, &mut demand).await {
            Ok(end) => end,
            Err(e) => {
                error!(path, "pipeline spawn failed: {e:#}");
                PipelineEnd::Failed {
                    establishment: true,
                }
            }
        };
        let uptime = started.elapsed();

        match end {
            PipelineEnd::Undemanded => {
                failures = 0;
                backoff = BACKOFF_MIN;
            }
            PipelineEnd::Failed { establishment } => {
                if uptime >= BACKOFF_RESET_UPTIME {
                    backoff = BACKOFF_MIN;
                    failures = 0;
                }
                if establishment {
                    failures += 1;
                }
                if failures >= QUARANTINE_THRESHOLD {
                    warn!(
                        path,
                        failures, "repeated stream failures, quarantining channel for 5 min"
                    );
                    quarantined_until = Some(Instant::now() + QUARANTINE);
                    failures = 0;
                    backoff = BACKOFF_MIN;
                    continue;
                }
                debug!(path, ?backoff, "restarting pipeline after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = wait_undemanded(&mut demand) => {}
                }
                backoff = next_backoff(backoff);
            }
        }
    }
}

/// Run feeder | ffmpeg until one of them exits or the stop hook fires.
async fn run_pipeline(
    spec: &PathSpec,
    cfg: &BridgeConfig,
    state: &Arc<BridgeState>,
    demand: &mut watch::Receiver<bool>,
) -> Result<PipelineEnd> {
    let host = state.dvr_host();
    if host.is_empty() {
        anyhow::bail!("no DVR host configured or discovered yet");
    }
    let path = spec.name();

    let feeder_bin = std::env::current_exe()
        .map(|p| p.with_file_name("feeder"))
        .context("locating feeder binary")?;
    let mut feeder = Command::new(&feeder_bin)
        .arg("--channel")
        .arg(spec.channel.to_string())
        .arg("--stream-type")
        .arg((spec.stream_type as u8).to_string())
        .arg("--host")
        .arg(&host)
        .arg("--cmd-port")
        .arg(cfg.cmd_port.to_string())
        .arg("--media-port")
        .arg(cfg.media_port.to_string())
        .arg("--username")
        .arg(&cfg.username)
        .arg("--password")
        .arg(&cfg.password)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", feeder_bin.display()))?;

    let feeder_out: Stdio = feeder
        .stdout
        .take()
        .context("feeder stdout missing")?
        .try_into()
        .context("converting feeder stdout to Stdio")?;

    let publish_url = format!("rtsp://127.0.0.1:{}/{}", cfg.rtsp_port, path);
    let ffmpeg = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "+genpts",
            "-r",
            "25",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            "-c",
            "copy",
            "-f",
            "rtsp",
        ])
        .arg(&publish_url)
        .stdin(feeder_out)
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn();
    let mut ffmpeg = match ffmpeg {
        Ok(child) => child,
        Err(e) => {
            shutdown_child(&mut feeder, "feeder").await;
            return Err(e).context("spawning ffmpeg");
        }
    };

    info!(path, %publish_url, "ingest pipeline up");
    state.set_streaming(spec.channel, spec.stream_type, true);

    let end = tokio::select! {
        status = feeder.wait() => {
            let status = status.ok();
            let code = status.and_then(|s| s.code());
            warn!(path, ?code, "feeder exited");
            match code {
                Some(2) => {
                    let strikes = state.record_session_failure();
                    debug!(path, strikes, "network failure recorded");
                }
                Some(0) => state.record_session_success(),
                _ => {}
            }
            PipelineEnd::Failed { establishment: matches!(code, Some(1) | Some(2) | Some(64)) }
        }
        status = ffmpeg.wait() => {
            warn!(path, ?status, "ffmpeg publisher exited");
            PipelineEnd::Failed { establishment: false }
        }
        _ = wait_undemanded(demand) => {
            debug!(path, "stop hook fired, tearing down pipeline");
            PipelineEnd::Undemanded
        }
    };

    // Feeder first: closing its stdout lets ffmpeg flush and exit.
    shutdown_child(&mut feeder, "feeder").await;
    shutdown_child(&mut ffmpeg, "ffmpeg").await;
    state.set_streaming(spec.channel, spec.stream_type, false);

    Ok(end)
}

async fn wait_undemanded(demand: &mut watch::Receiver<bool>) {
    while *demand.borrow() {
        if demand.changed().await.is_err() {
            return;
        }
    }
}

/// SIGTERM, wait up to the grace period, then SIGKILL.
pub async fn shutdown_child(child: &mut Child, name: &str) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    if timeout(CHILD_STOP_GRACE, child.wait()).await.is_err() {
        warn!(child = name, "did not stop in time, killing");
        let _ = child.kill().await;
    }
}
