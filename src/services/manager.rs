/// Shared bridge state and the DVR reachability / auto-discovery monitor.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::protocol::{discovery, StreamType};

/// Live status registry, written by the services and read by the HTTP
/// API. The status endpoint is the single source of truth for clients.
pub struct BridgeState {
    dvr_host: RwLock<String>,
    pub dvr_reachable: AtomicBool,
    /// Consecutive failed session attempts; 3 trigger a discovery scan.
    session_failures: AtomicU32,
    /// One flag per RTSP path, indexed `channel * 2 + stream_type`.
    streaming: Vec<AtomicBool>,
    recorder: Mutex<RecorderStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderStatus {
    pub enabled: bool,
    pub armed: bool,
    pub channels: Vec<u8>,
    pub segments_today: u32,
    pub upload_queue_len: u32,
    pub disk_free_mb: u64,
    pub disk_full: bool,
    pub last_error: Option<String>,
}

impl BridgeState {
    pub fn new(cfg: &BridgeConfig) -> Self {
        let streaming = (0..cfg.channels as usize * 2)
            .map(|_| AtomicBool::new(false))
            .collect();
        BridgeState {
            dvr_host: RwLock::new(cfg.dvr_host.clone()),
            dvr_reachable: AtomicBool::new(false),
            session_failures: AtomicU32::new(0),
            streaming,
            recorder: Mutex::new(RecorderStatus {
                enabled: cfg.record.enabled,
                channels: cfg.record.channels.clone(),
                ..RecorderStatus::default()
            }),
        }
    }

    pub fn dvr_host(&self) -> String {
        self.dvr_host.read().unwrap().clone()
    }

    pub fn set_dvr_host(&self, host: String) {
        *self.dvr_host.write().unwrap() = host;
    }

    pub fn set_streaming(&self, channel: u8, stream_type: StreamType, on: bool) {
        let idx = channel as usize * 2 + stream_type as usize;
        if let Some(flag) = self.streaming.get(idx) {
            flag.store(on, Ordering::Relaxed);
        }
    }

    /// True when either stream type of the channel is live.
    pub fn channel_streaming(&self, channel: u8) -> bool {
        let idx = channel as usize * 2;
        self.streaming
            .get(idx..idx + 2)
            .map(|flags| flags.iter().any(|f| f.load(Ordering::Relaxed)))
            .unwrap_or(false)
    }

    pub fn record_session_failure(&self) -> u32 {
        self.session_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_session_success(&self) {
        self.session_failures.store(0, Ordering::Relaxed);
        self.dvr_reachable.store(true, Ordering::Relaxed);
    }

    pub fn session_failures(&self) -> u32 {
        self.session_failures.load(Ordering::Relaxed)
    }

    pub fn recorder_status(&self) -> RecorderStatus {
        self.recorder.lock().unwrap().clone()
    }

    pub fn update_recorder(&self, update: impl FnOnce(&mut RecorderStatus)) {
        update(&mut self.recorder.lock().unwrap());
    }
}

/// Monitor the configured DVR and fall back to subnet scanning when it
/// goes missing. At most one scan per 60 s; a found responder replaces
/// the live host in memory (no persistence).
pub async fn discovery_monitor(
    cfg: BridgeConfig,
    state: Arc<BridgeState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_scan: Option<Instant> = None;
    let mut tick = interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {}
        }

        let host = state.dvr_host();
        let reachable = !host.is_empty() && discovery::reachable(&host, cfg.cmd_port).await;
        state.dvr_reachable.store(reachable, Ordering::Relaxed);

        let scan_needed = !reachable || state.session_failures() >= 3;
        if !scan_needed {
            continue;
        }
        if let Some(at) = last_scan {
            if at.elapsed() < discovery::SCAN_COOLDOWN {
                continue;
            }
        }

        if !reachable {
            warn!(%host, "DVR unreachable, starting discovery scan");
        } else {
            warn!(
                failures = state.session_failures(),
                "repeated session failures, starting discovery scan"
            );
        }
        last_scan = Some(Instant::now());

        if let Some(ip) = discovery::scan(cfg.cmd_port).await {
            let found = ip.to_string();
            if found != host {
                info!(old = %host, new = %found, "switching to discovered DVR host");
                state.set_dvr_host(found);
            }
            state.record_session_success();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn streaming_flags_track_per_path() {
        let state = BridgeState::new(&test_config());
        assert!(!state.channel_streaming(0));
        state.set_streaming(0, StreamType::Sub, true);
        assert!(state.channel_streaming(0));
        assert!(!state.channel_streaming(1));
        state.set_streaming(0, StreamType::Sub, false);
        assert!(!state.channel_streaming(0));
        // Out-of-range channels are ignored, not panicked on.
        state.set_streaming(9, StreamType::Main, true);
        assert!(!state.channel_streaming(9));
    }

    #[test]
    fn failure_counter_resets_on_success() {
        let state = BridgeState::new(&test_config());
        assert_eq!(state.record_session_failure(), 1);
        assert_eq!(state.record_session_failure(), 2);
        state.record_session_success();
        assert_eq!(state.session_failures(), 0);
    }
}
