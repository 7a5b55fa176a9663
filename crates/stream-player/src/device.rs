//! Audio output device boundary and CPAL device discovery.
//!
//! [`AudioDevice`] is a queue-of-buffers device: the pipeline generates a fixed set of buffer
//! handles, submits PCM into them, and reclaims them once played. The CPAL-backed
//! implementation lives in [`crate::playback`]; the helpers here choose which CPAL device and
//! stream config to drive.

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::{PlayerError, Result};
use crate::format::OutputFormat;

/// Handle of one device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Playback state reported by a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Playing,
    Paused,
    Stopped,
}

/// Queue-of-buffers audio output.
///
/// Counting follows the classic streaming-source model: [`queued_count`](Self::queued_count)
/// includes buffers that already finished playing but were not yet unqueued, and
/// [`processed_count`](Self::processed_count) is the subset that finished.
pub trait AudioDevice {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self);

    /// Bind the sample layout and rate of every buffer submitted from now on.
    fn configure(&mut self, format: OutputFormat, rate: u32) -> Result<()>;

    fn generate_buffers(&mut self, count: usize) -> Result<Vec<BufferId>>;

    /// Fill `buffer` with `pcm` and append it to the play queue.
    fn submit(&mut self, buffer: BufferId, pcm: &[u8]) -> Result<()>;

    fn queued_count(&self) -> Result<usize>;

    fn processed_count(&self) -> Result<usize>;

    /// Detach the oldest finished buffer so it can be refilled.
    fn unqueue_processed(&mut self) -> Result<Option<BufferId>>;

    fn play(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Stop playback; every queued buffer counts as processed afterwards.
    fn stop(&mut self) -> Result<()>;

    fn state(&self) -> Result<DeviceState>;

    /// No more buffers will be submitted; queue any audio held back from earlier
    /// submissions (for example rate-converter carry).
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host
            .output_devices()
            .map_err(|e| PlayerError::device(format!("no output devices: {e}")))?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| PlayerError::device(format!("no output device matched: {needle}")));
    }

    host.default_output_device()
        .ok_or_else(|| PlayerError::device("no default output device"))
}

/// Choose an output config for `target_rate`.
///
/// Prefers the highest rate that is `<= target_rate`, falling back to the lowest rate above
/// it; ties break on sample format (float first).
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges = device
        .supported_output_configs()
        .map_err(PlayerError::device)?;

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: rate <= target_rate,
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best
            .as_ref()
            .map(|(b, _)| candidate.is_better_than(b))
            .unwrap_or(true);
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| PlayerError::device("no supported output configs"))
}

/// Prefer the largest fixed callback size up to a cap, to reduce underruns.
///
/// `None` leaves the choice to the backend.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            let chosen = if *max > MAX_FRAMES {
                (*min).max(MAX_FRAMES)
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Names of the host's output devices, in enumeration order.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host
        .output_devices()
        .map_err(|e| PlayerError::device(format!("no output devices: {e}")))?;
    let mut names = Vec::new();
    for d in devices {
        let name = d.description().map_err(PlayerError::device)?;
        names.push(name.to_string());
    }
    Ok(names)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, best: &Candidate) -> bool {
        if self.below != best.below {
            self.below
        } else if self.rate != best.rate {
            // Below the target a higher rate is closer; above it a lower one is.
            (self.rate > best.rate) == self.below
        } else {
            self.format_rank < best.format_rank
        }
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
