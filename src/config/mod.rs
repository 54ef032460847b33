use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::protocol::client::{DEFAULT_CMD_PORT, DEFAULT_MEDIA_PORT};
use crate::protocol::{StreamType, MAX_CHANNELS};

/// Top-level bridge configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Configured DVR address. May be empty: auto-discovery then has to
    /// find a responder before any session can start.
    pub dvr_host: String,
    pub cmd_port: u16,
    pub media_port: u16,
    pub username: String,
    pub password: String,
    /// Number of camera channels exposed as RTSP paths.
    pub channels: u8,
    pub web_port: u16,
    /// Dashboard asset directory.
    pub web_dir: PathBuf,
    pub rtsp_port: u16,
    /// mediamtx binary (name or path).
    pub rtsp_bin: String,
    pub record: RecordConfig,
}

#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub enabled: bool,
    pub channels: Vec<u8>,
    pub segment_minutes: u32,
    pub stream_type: StreamType,
    pub record_dir: PathBuf,
    /// 0 keeps segments forever.
    pub retention_hours: u32,
    pub schedule: Schedule,
    pub min_disk_mb: u64,
    /// Off-site upload command with {file}/{channel}/{filename}
    /// placeholders; None disables upload.
    pub upload_command: Option<String>,
    pub upload_delete_local: bool,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        let channels = env_parse("DVR_CHANNELS", 4u8)?;
        if channels == 0 || channels > MAX_CHANNELS {
            bail!("DVR_CHANNELS must be 1..={MAX_CHANNELS}, got {channels}");
        }

        let record_channels = parse_channel_list(
            &env_str("DVR_RECORD_CHANNELS", "0"),
            channels,
        )
        .context("DVR_RECORD_CHANNELS")?;

        Ok(BridgeConfig {
            dvr_host: env_str("DVR_HOST", ""),
            cmd_port: env_parse("DVR_CMD_PORT", DEFAULT_CMD_PORT)?,
            media_port: env_parse("DVR_MEDIA_PORT", DEFAULT_MEDIA_PORT)?,
            username: env_str("DVR_USERNAME", "admin"),
            password: env_str("DVR_PASSWORD", "123456"),
            channels,
            web_port: env_parse("DVR_WEB_PORT", 8080u16)?,
            web_dir: env_str("DVR_WEB_DIR", "web").into(),
            rtsp_port: env_parse("DVR_RTSP_PORT", 8554u16)?,
            rtsp_bin: env_str("DVR_RTSP_BIN", "mediamtx"),
            record: RecordConfig {
                enabled: env_bool("DVR_RECORD_ENABLED", false),
                channels: record_channels,
                segment_minutes: env_parse("DVR_RECORD_SEGMENT_MIN", 15u32)?,
                stream_type: env_parse("DVR_RECORD_STREAM_TYPE", StreamType::Main)?,
                record_dir: env_str("DVR_RECORD_DIR", "recordings").into(),
                retention_hours: env_parse("DVR_RECORD_RETENTION_HR", 24u32)?,
                schedule: env_parse("DVR_RECORD_SCHEDULE", Schedule::always())?,
                min_disk_mb: env_parse("DVR_RECORD_MIN_DISK_MB", 500u64)?,
                upload_command: std::env::var("DVR_UPLOAD_COMMAND")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                upload_delete_local: env_bool("DVR_UPLOAD_DELETE_LOCAL", false),
            },
        })
    }

    /// RTSP path names published by the bridge: `ch<N>` (main) and
    /// `ch<N>sub` for each channel.
    pub fn rtsp_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for ch in 0..self.channels {
            paths.push(format!("ch{ch}"));
            paths.push(format!("ch{ch}sub"));
        }
        paths
    }
}

/// Set of armed wall-clock hours, parsed from ranges like `0-7,22-23`.
/// A range that wraps midnight (`22-6`) is allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    hours: BTreeSet<u8>,
}

impl Schedule {
    pub fn always() -> Self {
        Schedule {
            hours: (0..24).collect(),
        }
    }

    pub fn contains(&self, hour: u8) -> bool {
        self.hours.contains(&hour)
    }

    pub fn hours(&self) -> Vec<u8> {
        self.hours.iter().copied().collect()
    }
}

impl FromStr for Schedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut hours = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((a, b)) => {
                    let a = parse_hour(a)?;
                    let b = parse_hour(b)?;
                    if a <= b {
                        hours.extend(a..=b);
                    } else {
                        // Wraps midnight, e.g. 22-6.
                        hours.extend(a..24);
                        hours.extend(0..=b);
                    }
                }
                None => {
                    hours.insert(parse_hour(part)?);
                }
            }
        }
        if hours.is_empty() {
            bail!("schedule {s:?} selects no hours");
        }
        Ok(Schedule { hours })
    }
}

fn parse_hour(s: &str) -> Result<u8> {
    let hour: u8 = s
        .trim()
        .parse()
        .with_context(|| format!("bad hour {s:?}"))?;
    if hour > 23 {
        bail!("hour {hour} out of range 0-23");
    }
    Ok(hour)
}

/// Comma-separated channel list, validated against the channel count.
pub fn parse_channel_list(s: &str, channel_count: u8) -> Result<Vec<u8>> {
    let mut channels = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let ch: u8 = part
            .parse()
            .with_context(|| format!("bad channel {part:?}"))?;
        if ch >= channel_count {
            bail!("channel {ch} out of range 0..{channel_count}");
        }
        if !channels.contains(&ch) {
            channels.push(ch);
        }
    }
    Ok(channels)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={v:?}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Fixed configuration for unit tests; never reads the environment.
#[cfg(test)]
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        dvr_host: "192.0.2.1".to_string(),
        cmd_port: 5050,
        media_port: 6050,
        username: "admin".to_string(),
        password: "123456".to_string(),
        channels: 2,
        web_port: 8080,
        web_dir: "web".into(),
        rtsp_port: 8554,
        rtsp_bin: "mediamtx".to_string(),
        record: RecordConfig {
            enabled: false,
            channels: vec![0],
            segment_minutes: 15,
            stream_type: StreamType::Main,
            record_dir: "recordings".into(),
            retention_hours: 24,
            schedule: Schedule::always(),
            min_disk_mb: 500,
            upload_command: None,
            upload_delete_local: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_ranges() {
        let s: Schedule = "0-7,22-23".parse().unwrap();
        assert!(s.contains(0));
        assert!(s.contains(7));
        assert!(!s.contains(8));
        assert!(!s.contains(21));
        assert!(s.contains(22));
        assert!(s.contains(23));
    }

    #[test]
    fn schedule_wraps_midnight() {
        let s: Schedule = "22-6".parse().unwrap();
        assert!(s.contains(23));
        assert!(s.contains(0));
        assert!(s.contains(6));
        assert!(!s.contains(7));
        assert!(!s.contains(21));
    }

    #[test]
    fn schedule_singletons_and_always() {
        let s: Schedule = "5".parse().unwrap();
        assert_eq!(s.hours(), vec![5]);
        assert_eq!(Schedule::always().hours().len(), 24);
    }

    #[test]
    fn schedule_rejects_junk() {
        assert!("25".parse::<Schedule>().is_err());
        assert!("a-b".parse::<Schedule>().is_err());
        assert!("".parse::<Schedule>().is_err());
    }

    #[test]
    fn channel_lists() {
        assert_eq!(parse_channel_list("0,2", 4).unwrap(), vec![0, 2]);
        assert_eq!(parse_channel_list("1, 1", 4).unwrap(), vec![1]);
        assert!(parse_channel_list("4", 4).is_err());
        assert!(parse_channel_list("x", 4).is_err());
    }
}
