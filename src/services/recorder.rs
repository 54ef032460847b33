/// Schedule-gated segmented recorder. One task owns all recorder state;
/// the HTTP API talks to it over a command channel.
///
/// While armed (current local hour in the schedule, or a manual start
/// override), each configured channel runs an ffmpeg segmenter pulling
/// from the local RTSP server and writing UTC-named MP4 segments. Dead
/// segmenters restart with the same backoff as the ingest pipelines.
/// Every five minutes, segments past the retention age are pruned unless
/// their upload sidecar marks them pending or in flight.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, RecordConfig};
use crate::services::ingest::{next_backoff, shutdown_child};
use crate::services::manager::BridgeState;
use crate::services::upload::{self, SegmentJob, Sidecar, UploadState};

const SCHEDULE_TICK: Duration = Duration::from_secs(60);
const CHILD_TICK: Duration = Duration::from_secs(3);
const PRUNE_TICK: Duration = Duration::from_secs(300);
/// A segment counts as complete once untouched for this long.
const SEGMENT_SETTLE: Duration = Duration::from_secs(60);
const SEG_BACKOFF_MIN: Duration = Duration::from_secs(3);
const SEG_BACKOFF_RESET_UPTIME: Duration = Duration::from_secs(60);
const SEGMENT_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Manual overrides from the HTTP API.
#[derive(Debug)]
pub enum RecorderCommand {
    Start,
    Stop,
}

struct Segmenter {
    child: Child,
    started: Instant,
}

struct ChannelState {
    segmenter: Option<Segmenter>,
    backoff: Duration,
    not_before: Instant,
}

impl ChannelState {
    fn new() -> Self {
        ChannelState {
            segmenter: None,
            backoff: SEG_BACKOFF_MIN,
            not_before: Instant::now(),
        }
    }
}

pub async fn run(
    cfg: BridgeConfig,
    state: Arc<BridgeState>,
    mut commands: mpsc::Receiver<RecorderCommand>,
    upload_tx: Option<mpsc::Sender<SegmentJob>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let rec = cfg.record.clone();
    if rec.channels.is_empty() {
        info!("recorder idle: no channels configured");
        return;
    }
    info!(
        channels = ?rec.channels,
        segment_minutes = rec.segment_minutes,
        schedule = ?rec.schedule.hours(),
        "recorder ready"
    );

    let mut channels: HashMap<u8, ChannelState> = rec
        .channels
        .iter()
        .map(|&ch| (ch, ChannelState::new()))
        .collect();
    let mut armed_override: Option<bool> = None;

    let mut schedule_tick = interval(SCHEDULE_TICK);
    let mut child_tick = interval(CHILD_TICK);
    let mut prune_tick = interval(PRUNE_TICK);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            cmd = commands.recv() => match cmd {
                Some(RecorderCommand::Start) => {
                    info!("manual recording start");
                    armed_override = Some(true);
                }
                Some(RecorderCommand::Stop) => {
                    info!("manual recording stop");
                    armed_override = Some(false);
                }
                None => break,
            },
            _ = schedule_tick.tick() => {
                scan_completed(&rec, &state, upload_tx.as_ref());
                update_status(&rec, &state);
            }
            _ = child_tick.tick() => {}
            _ = prune_tick.tick() => {
                let removed = prune_with_cutoff(
                    &rec.record_dir,
                    retention_cutoff(rec.retention_hours),
                );
                if removed > 0 {
                    info!(removed, "retention pruning removed old segments");
                }
            }
        }
        evaluate(&cfg, &rec, &state, &mut channels, armed_override).await;
    }

    for channel_state in channels.values_mut() {
        if let Some(mut seg) = channel_state.segmenter.take() {
            shutdown_child(&mut seg.child, "segmenter").await;
        }
    }
    info!("recorder stopped");
}

fn is_armed(rec: &RecordConfig, armed_override: Option<bool>, local_hour: u8) -> bool {
    armed_override.unwrap_or_else(|| rec.enabled && rec.schedule.contains(local_hour))
}

async fn evaluate(
    cfg: &BridgeConfig,
    rec: &RecordConfig,
    state: &Arc<BridgeState>,
    channels: &mut HashMap<u8, ChannelState>,
    armed_override: Option<bool>,
) {
    let armed = is_armed(rec, armed_override, Local::now().hour() as u8);
    state.update_recorder(|r| r.armed = armed);

    for (&channel, channel_state) in channels.iter_mut() {
        // Reap a dead segmenter and schedule its restart.
        if let Some(seg) = channel_state.segmenter.as_mut() {
            if let Ok(Some(status)) = seg.child.try_wait() {
                warn!(channel, %status, "segmenter exited unexpectedly");
                state.update_recorder(|r| {
                    r.last_error = Some(format!("segmenter ch{channel} exited: {status}"))
                });
                if seg.started.elapsed() >= SEG_BACKOFF_RESET_UPTIME {
                    channel_state.backoff = SEG_BACKOFF_MIN;
                }
                channel_state.not_before = Instant::now() + channel_state.backoff;
                channel_state.backoff = next_backoff(channel_state.backoff);
                channel_state.segmenter = None;
            }
        }

        if !armed {
            if let Some(mut seg) = channel_state.segmenter.take() {
                info!(channel, "disarmed, stopping segmenter");
                shutdown_child(&mut seg.child, "segmenter").await;
                channel_state.backoff = SEG_BACKOFF_MIN;
                channel_state.not_before = Instant::now();
            }
            continue;
        }
        if channel_state.segmenter.is_some() || Instant::now() < channel_state.not_before {
            continue;
        }

        // Free-space gate before every (re)spawn.
        match disk_free_mb(&rec.record_dir) {
            Ok(free) if free < rec.min_disk_mb => {
                warn!(
                    channel,
                    free_mb = free,
                    min_mb = rec.min_disk_mb,
                    "disk full, refusing to start segmenter"
                );
                state.update_recorder(|r| {
                    r.disk_full = true;
                    r.disk_free_mb = free;
                    r.last_error = Some(format!("disk full: {free} MB free"));
                });
                channel_state.not_before = Instant::now() + SCHEDULE_TICK;
                continue;
            }
            Ok(free) => {
                state.update_recorder(|r| {
                    r.disk_full = false;
                    r.disk_free_mb = free;
                });
            }
            Err(e) => debug!("statvfs on record dir failed: {e:#}"),
        }

        match spawn_segmenter(cfg, rec, channel) {
            Ok(child) => {
                channel_state.segmenter = Some(Segmenter {
                    child,
                    started: Instant::now(),
                });
            }
            Err(e) => {
                warn!(channel, "segmenter spawn failed: {e:#}");
                channel_state.not_before = Instant::now() + channel_state.backoff;
                channel_state.backoff = next_backoff(channel_state.backoff);
            }
        }
    }
}

fn spawn_segmenter(cfg: &BridgeConfig, rec: &RecordConfig, channel: u8) -> Result<Child> {
    let ch_dir = rec.record_dir.join(format!("ch{channel}"));
    std::fs::create_dir_all(&ch_dir)
        .with_context(|| format!("creating {}", ch_dir.display()))?;

    let source = format!(
        "rtsp://127.0.0.1:{}/ch{}{}",
        cfg.rtsp_port,
        channel,
        rec.stream_type.path_suffix()
    );
    let pattern = ch_dir.join(format!("{SEGMENT_TIME_FORMAT}.mp4"));
    let segment_secs = rec.segment_minutes * 60;

    let child = Command::new("ffmpeg")
        // strftime in the muxer uses localtime; pin the child to UTC so
        // segment names encode UTC start times.
        .env("TZ", "UTC")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-rtsp_transport",
            "tcp",
            "-i",
        ])
        .arg(&source)
        .args(["-c", "copy", "-f", "segment", "-segment_time"])
        .arg(segment_secs.to_string())
        .args([
            "-segment_format",
            "mp4",
            "-segment_format_options",
            "movflags=+frag_keyframe+empty_moov",
            "-strftime",
            "1",
            "-reset_timestamps",
            "1",
        ])
        .arg(&pattern)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("spawning ffmpeg segmenter")?;

    info!(channel, %source, dir = %ch_dir.display(), segment_secs, "segmenter started");
    Ok(child)
}

/// Hand completed, not-yet-tracked segments to the upload worker. The
/// sidecar is only written once the job is actually queued; a full queue
/// just defers to the next scan.
fn scan_completed(
    rec: &RecordConfig,
    state: &Arc<BridgeState>,
    upload_tx: Option<&mpsc::Sender<SegmentJob>>,
) {
    let Some(tx) = upload_tx else { return };
    let now = SystemTime::now();

    for (channel_dir, path, meta) in each_segment(&rec.record_dir) {
        if meta.len() == 0 || upload::read_sidecar(&path).is_some() {
            continue;
        }
        let settled = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age >= SEGMENT_SETTLE);
        if !settled {
            continue;
        }

        let job = SegmentJob {
            path: path.clone(),
            channel: channel_dir,
        };
        match tx.try_send(job) {
            Ok(()) => {
                let _ = upload::write_sidecar(
                    &path,
                    &Sidecar {
                        state: UploadState::Pending,
                        attempts: 0,
                    },
                );
                state.update_recorder(|r| r.upload_queue_len += 1);
            }
            Err(mpsc::error::TrySendError::Full(_)) => break,
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

fn retention_cutoff(retention_hours: u32) -> Option<SystemTime> {
    if retention_hours == 0 {
        return None; // retention disabled
    }
    SystemTime::now().checked_sub(Duration::from_secs(u64::from(retention_hours) * 3600))
}

/// Delete segments modified before `cutoff`, honoring upload exemptions.
/// Returns the number of removed files.
fn prune_with_cutoff(record_dir: &Path, cutoff: Option<SystemTime>) -> usize {
    let Some(cutoff) = cutoff else { return 0 };
    let mut removed = 0;
    for (channel_dir, path, meta) in each_segment(record_dir) {
        let old = meta.modified().is_ok_and(|m| m < cutoff);
        if !old {
            continue;
        }
        if let Some(sidecar) = upload::read_sidecar(&path) {
            if sidecar.state.exempt_from_pruning() {
                continue;
            }
        }
        if std::fs::remove_file(&path).is_ok() {
            upload::remove_sidecar(&path);
            info!(channel = %channel_dir, file = %path.display(), "pruned old segment");
            removed += 1;
        }
    }
    removed
}

fn update_status(rec: &RecordConfig, state: &Arc<BridgeState>) {
    let today = Utc::now().format("%Y%m%d").to_string();
    let mut segments_today = 0u32;
    for (_, path, _) in each_segment(&rec.record_dir) {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if name.starts_with(&*today) {
            segments_today += 1;
        }
    }
    let free = disk_free_mb(&rec.record_dir).unwrap_or_default();
    state.update_recorder(|r| {
        r.segments_today = segments_today;
        r.disk_free_mb = free;
    });
}

pub fn disk_free_mb(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64 / (1024 * 1024))
}

fn each_segment(record_dir: &Path) -> Vec<(String, PathBuf, std::fs::Metadata)> {
    let mut segments = Vec::new();
    let Ok(entries) = std::fs::read_dir(record_dir) else {
        return segments;
    };
    for entry in entries.flatten() {
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if !dir_name.starts_with("ch") || !entry.path().is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(entry.path()) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().is_some_and(|e| e == "mp4") {
                if let Ok(meta) = file.metadata() {
                    segments.push((dir_name.clone(), path, meta));
                }
            }
        }
    }
    segments
}

/// One row of `GET /api/recordings`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    pub channel: u8,
    pub path: String,
    pub start_utc: String,
    pub duration_s: u64,
    pub size_bytes: u64,
    pub upload_state: &'static str,
}

/// List all local segments, newest first.
pub fn list_recordings(record_dir: &Path) -> Vec<RecordingEntry> {
    let mut entries = Vec::new();
    for (channel_dir, path, meta) in each_segment(record_dir) {
        let Some(channel) = channel_dir.strip_prefix("ch").and_then(|s| s.parse().ok()) else {
            continue;
        };
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let start = parse_segment_start(&name);
        let duration_s = match (start, meta.modified().ok()) {
            (Some(start), Some(mtime)) => {
                let mtime: DateTime<Utc> = mtime.into();
                (mtime - start).num_seconds().max(0) as u64
            }
            _ => 0,
        };
        let upload_state = upload::read_sidecar(&path)
            .map(|s| s.state)
            .unwrap_or(UploadState::Pending)
            .as_str();

        entries.push(RecordingEntry {
            channel,
            path: format!("{channel_dir}/{name}"),
            start_utc: start.map(|s| s.to_rfc3339()).unwrap_or_default(),
            duration_s,
            size_bytes: meta.len(),
            upload_state,
        });
    }
    entries.sort_by(|a, b| b.start_utc.cmp(&a.start_utc));
    entries
}

fn parse_segment_start(filename: &str) -> Option<DateTime<Utc>> {
    let stem = filename.strip_suffix(".mp4")?;
    NaiveDateTime::parse_from_str(stem, SEGMENT_TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

/// Delete one segment. The filename must be a bare segment name with no
/// separators or parent references.
pub fn delete_recording(record_dir: &Path, channel: u8, filename: &str) -> Result<bool> {
    if !valid_segment_name(filename) {
        bail!("invalid segment filename: {filename:?}");
    }
    let path = record_dir.join(format!("ch{channel}")).join(filename);
    if !path.is_file() {
        return Ok(false);
    }
    std::fs::remove_file(&path)?;
    upload::remove_sidecar(&path);
    info!(file = %path.display(), "recording deleted");
    Ok(true)
}

fn valid_segment_name(name: &str) -> bool {
    name.ends_with(".mp4")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.starts_with('.')
}

/// Delete every segment; returns the number removed.
pub fn delete_all_recordings(record_dir: &Path) -> usize {
    let mut removed = 0;
    for (_, path, _) in each_segment(record_dir) {
        if std::fs::remove_file(&path).is_ok() {
            upload::remove_sidecar(&path);
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, "deleted all recordings");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Schedule;

    fn record_config(dir: &Path) -> RecordConfig {
        RecordConfig {
            enabled: true,
            channels: vec![0],
            segment_minutes: 15,
            stream_type: crate::protocol::StreamType::Main,
            record_dir: dir.to_path_buf(),
            retention_hours: 24,
            schedule: "0-7,22-23".parse().unwrap(),
            min_disk_mb: 0,
            upload_command: None,
            upload_delete_local: false,
        }
    }

    fn seed_segment(dir: &Path, channel: u8, name: &str) -> PathBuf {
        let ch_dir = dir.join(format!("ch{channel}"));
        std::fs::create_dir_all(&ch_dir).unwrap();
        let path = ch_dir.join(name);
        std::fs::write(&path, vec![0u8; 16]).unwrap();
        path
    }

    #[test]
    fn arming_follows_schedule_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record_config(dir.path());

        assert!(is_armed(&rec, None, 0));
        assert!(is_armed(&rec, None, 23));
        assert!(!is_armed(&rec, None, 12));
        // Manual override beats the schedule in both directions.
        assert!(is_armed(&rec, Some(true), 12));
        assert!(!is_armed(&rec, Some(false), 0));

        let disabled = RecordConfig {
            enabled: false,
            schedule: Schedule::always(),
            ..record_config(dir.path())
        };
        assert!(!is_armed(&disabled, None, 12));
        assert!(is_armed(&disabled, Some(true), 12));
    }

    #[test]
    fn listing_parses_names_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let a = seed_segment(dir.path(), 0, "20260801T001500Z.mp4");
        seed_segment(dir.path(), 1, "20260801T003000Z.mp4");
        seed_segment(dir.path(), 0, "not-a-segment.txt");

        upload::write_sidecar(
            &a,
            &Sidecar {
                state: UploadState::Uploaded,
                attempts: 1,
            },
        )
        .unwrap();

        let entries = list_recordings(dir.path());
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].channel, 1);
        assert_eq!(entries[0].upload_state, "pending");
        assert_eq!(entries[1].channel, 0);
        assert_eq!(entries[1].upload_state, "uploaded");
        assert!(entries[1].start_utc.starts_with("2026-08-01T00:15:00"));
        assert_eq!(entries[1].size_bytes, 16);
    }

    #[test]
    fn delete_guards_against_traversal() {
        let dir = tempfile::tempdir().unwrap();
        seed_segment(dir.path(), 0, "20260801T001500Z.mp4");

        assert!(delete_recording(dir.path(), 0, "../../etc/passwd").is_err());
        assert!(delete_recording(dir.path(), 0, "x/y.mp4").is_err());
        assert!(delete_recording(dir.path(), 0, ".hidden.mp4").is_err());
        assert!(!delete_recording(dir.path(), 0, "missing.mp4").unwrap());
        assert!(delete_recording(dir.path(), 0, "20260801T001500Z.mp4").unwrap());
        assert!(list_recordings(dir.path()).is_empty());
    }

    #[test]
    fn pruning_honors_upload_exemptions() {
        let dir = tempfile::tempdir().unwrap();
        let keep_pending = seed_segment(dir.path(), 0, "20260801T000000Z.mp4");
        let keep_flight = seed_segment(dir.path(), 0, "20260801T001500Z.mp4");
        let drop_done = seed_segment(dir.path(), 0, "20260801T003000Z.mp4");
        let drop_bare = seed_segment(dir.path(), 0, "20260801T004500Z.mp4");

        for (path, state) in [
            (&keep_pending, UploadState::Pending),
            (&keep_flight, UploadState::InProgress),
            (&drop_done, UploadState::Uploaded),
        ] {
            upload::write_sidecar(path, &Sidecar { state, attempts: 0 }).unwrap();
        }

        // Cutoff in the future: every file is "old enough" to prune.
        let cutoff = Some(SystemTime::now() + Duration::from_secs(3600));
        assert_eq!(prune_with_cutoff(dir.path(), cutoff), 2);
        assert!(keep_pending.exists());
        assert!(keep_flight.exists());
        assert!(!drop_done.exists());
        assert!(!drop_bare.exists());

        // Second cycle is a no-op for the exempt files.
        assert_eq!(prune_with_cutoff(dir.path(), cutoff), 0);
        // Retention disabled prunes nothing.
        assert_eq!(prune_with_cutoff(dir.path(), None), 0);
    }

    #[test]
    fn delete_all_counts() {
        let dir = tempfile::tempdir().unwrap();
        seed_segment(dir.path(), 0, "20260801T000000Z.mp4");
        seed_segment(dir.path(), 1, "20260801T001500Z.mp4");
        assert_eq!(delete_all_recordings(dir.path()), 2);
        assert_eq!(delete_all_recordings(dir.path()), 0);
    }

    #[test]
    fn segment_name_parsing() {
        let start = parse_segment_start("20260801T120000Z.mp4").unwrap();
        assert_eq!(start.to_rfc3339(), "2026-08-01T12:00:00+00:00");
        assert!(parse_segment_start("junk.mp4").is_none());
        assert!(parse_segment_start("20260801T120000Z.ts").is_none());
    }
}
