use std::time::Duration;

use anyhow::{Result, bail};
use stream_player::config::PlaybackConfig;

use crate::cli::Args;

/// Everything `runtime::run` needs, resolved from the command line.
#[derive(Clone, Debug)]
pub struct NetplayConfig {
    pub source: String,
    pub device: Option<String>,
    pub playback: PlaybackConfig,
    pub threaded: bool,
    pub status_json: bool,
    pub http_timeout: Duration,
}

impl NetplayConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let Some(source) = args.source.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            bail!("missing stream URL or file path");
        };
        let playback = PlaybackConfig {
            ring_capacity: args.ring_capacity,
            max_gap: args.max_gap,
            device_buffers: args.buffers,
            buffer_seconds: args.buffer_seconds,
            tick_interval: Duration::from_millis(args.tick_ms),
            ..PlaybackConfig::default()
        };
        Ok(Self {
            source: source.to_string(),
            device: normalize_device_name(args.device.clone()),
            playback,
            threaded: args.threaded,
            status_json: args.status_json,
            http_timeout: Duration::from_secs(args.timeout_secs.max(1)),
        })
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
