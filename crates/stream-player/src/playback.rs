//! CPAL-backed [`AudioDevice`].
//!
//! CPAL pulls samples from a real-time callback, while the pipeline pushes whole buffers. The
//! device bridges the two with a shared queue of submitted buffers:
//! - `submit` converts PCM bytes to `f32` (resampling if the device rate differs) and appends
//! - the callback drains the front buffer and moves it to "processed" once fully played
//! - an empty queue outputs silence and reports [`DeviceState::Stopped`]
//!
//! The output stream runs for the whole session; pause and stop are applied in the callback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cpal::traits::{DeviceTrait, StreamTrait};

use crate::device::{self, AudioDevice, BufferId, DeviceState};
use crate::error::{PlayerError, Result};
use crate::format::{OutputFormat, SampleEncoding};
use crate::resample::StreamResampler;

struct QueuedBuffer {
    id: BufferId,
    samples: Vec<f32>,
}

/// State shared between the pipeline thread and the CPAL callback.
struct DeviceQueue {
    queued: VecDeque<QueuedBuffer>,
    processed: VecDeque<BufferId>,
    state: DeviceState,
    /// Sample index into the front queued buffer.
    pos: usize,
    src_channels: usize,
}

impl DeviceQueue {
    fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            processed: VecDeque::new(),
            state: DeviceState::Stopped,
            pos: 0,
            src_channels: 1,
        }
    }

    /// Fill one callback's worth of interleaved output.
    fn render<T>(&mut self, data: &mut [T], channels_out: usize)
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
        if self.state != DeviceState::Playing || channels_out == 0 {
            data.fill(silence);
            return;
        }

        let frames = data.len() / channels_out;
        for frame in 0..frames {
            if !self.advance_to_audio() {
                data[frame * channels_out..].fill(silence);
                self.state = DeviceState::Stopped;
                return;
            }
            for ch in 0..channels_out {
                data[frame * channels_out + ch] =
                    <T as cpal::Sample>::from_sample::<f32>(self.mapped_sample(channels_out, ch));
            }
            self.pos += self.src_channels;
        }
    }

    /// Retire fully played buffers; `false` when nothing is left to play.
    fn advance_to_audio(&mut self) -> bool {
        loop {
            match self.queued.front() {
                Some(front) if self.pos < front.samples.len() => return true,
                Some(_) => {
                    if let Some(done) = self.queued.pop_front() {
                        self.processed.push_back(done.id);
                    }
                    self.pos = 0;
                }
                None => return false,
            }
        }
    }

    /// Mono is duplicated to stereo, stereo is averaged to mono, anything else clamps to the
    /// last source channel.
    fn mapped_sample(&self, dst_channels: usize, dst_ch: usize) -> f32 {
        let Some(front) = self.queued.front() else {
            return 0.0;
        };
        let src = |ch: usize| -> f32 {
            front.samples.get(self.pos + ch).copied().unwrap_or(0.0)
        };
        match (self.src_channels, dst_channels) {
            (2, 1) => 0.5 * (src(0) + src(1)),
            (1, _) => src(0),
            (s, _) => src(dst_ch.min(s.saturating_sub(1))),
        }
    }

    fn stop(&mut self) {
        for buf in self.queued.drain(..) {
            self.processed.push_back(buf.id);
        }
        self.pos = 0;
        self.state = DeviceState::Stopped;
    }
}

/// Queue-of-buffers device playing through a CPAL output stream.
pub struct CpalQueueDevice {
    host: cpal::Host,
    needle: Option<String>,
    chunk_frames: usize,
    device: Option<cpal::Device>,
    stream: Option<cpal::Stream>,
    shared: Arc<Mutex<DeviceQueue>>,
    format: Option<OutputFormat>,
    resampler: Option<StreamResampler>,
    generated: u32,
}

impl CpalQueueDevice {
    /// `needle` selects an output device by name substring; `chunk_frames` sizes the rate
    /// converter when one is needed.
    pub fn new(needle: Option<String>, chunk_frames: usize) -> Self {
        Self {
            host: cpal::default_host(),
            needle,
            chunk_frames,
            device: None,
            stream: None,
            shared: Arc::new(Mutex::new(DeviceQueue::new())),
            format: None,
            resampler: None,
            generated: 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceQueue> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_device_samples(&mut self, pcm: &[u8]) -> Result<Vec<f32>> {
        let format = self
            .format
            .ok_or_else(|| PlayerError::device("submit before configure"))?;
        let samples = pcm_to_f32(pcm, format);
        match self.resampler.as_mut() {
            Some(rs) => rs.process(&samples),
            None => Ok(samples),
        }
    }
}

impl AudioDevice for CpalQueueDevice {
    fn open(&mut self) -> Result<()> {
        let device = device::pick_device(&self.host, self.needle.as_deref())?;
        if let Ok(desc) = device.description() {
            tracing::info!(device = %desc.name(), "output device opened");
        }
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
        let mut g = self.lock();
        g.queued.clear();
        g.processed.clear();
        g.state = DeviceState::Stopped;
        drop(g);
        self.device = None;
        self.resampler = None;
    }

    fn configure(&mut self, format: OutputFormat, rate: u32) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| PlayerError::device("configure before open"))?;
        let supported = device::pick_output_config(device, rate)?;
        let sample_format = supported.sample_format();
        let mut config: cpal::StreamConfig = supported.config();
        if let Some(size) = device::pick_buffer_size(&supported) {
            config.buffer_size = size;
        }

        let channels = format.channels() as usize;
        self.resampler = if config.sample_rate == rate {
            tracing::info!(rate_hz = rate, "resample skipped");
            None
        } else {
            tracing::info!(from_hz = rate, to_hz = config.sample_rate, "resampling");
            Some(StreamResampler::new(
                rate,
                config.sample_rate,
                channels,
                self.chunk_frames,
            )?)
        };
        self.lock().src_channels = channels;

        let stream = build_output_stream(device, &config, sample_format, self.shared.clone())?;
        stream.play().map_err(PlayerError::device)?;
        tracing::debug!(
            channels_out = config.channels,
            rate_hz = config.sample_rate,
            sample_format = ?sample_format,
            "output stream running"
        );
        self.stream = Some(stream);
        self.format = Some(format);
        Ok(())
    }

    fn generate_buffers(&mut self, count: usize) -> Result<Vec<BufferId>> {
        let start = self.generated;
        let count = u32::try_from(count).map_err(PlayerError::device)?;
        self.generated = start
            .checked_add(count)
            .ok_or_else(|| PlayerError::device("too many buffers"))?;
        Ok((start..self.generated).map(BufferId).collect())
    }

    fn submit(&mut self, buffer: BufferId, pcm: &[u8]) -> Result<()> {
        if buffer.0 >= self.generated {
            return Err(PlayerError::device(format!("unknown buffer {}", buffer.0)));
        }
        {
            let g = self.lock();
            if g.queued.iter().any(|b| b.id == buffer) || g.processed.contains(&buffer) {
                return Err(PlayerError::device(format!(
                    "buffer {} is still queued",
                    buffer.0
                )));
            }
        }
        let samples = self.to_device_samples(pcm)?;
        self.lock().queued.push_back(QueuedBuffer {
            id: buffer,
            samples,
        });
        Ok(())
    }

    fn queued_count(&self) -> Result<usize> {
        let g = self.lock();
        Ok(g.queued.len() + g.processed.len())
    }

    fn processed_count(&self) -> Result<usize> {
        Ok(self.lock().processed.len())
    }

    fn unqueue_processed(&mut self) -> Result<Option<BufferId>> {
        Ok(self.lock().processed.pop_front())
    }

    fn play(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Err(PlayerError::device("play before configure"));
        }
        self.lock().state = DeviceState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let mut g = self.lock();
        if g.state == DeviceState::Playing {
            g.state = DeviceState::Paused;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut g = self.lock();
        if g.state == DeviceState::Paused {
            g.state = DeviceState::Playing;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lock().stop();
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
        Ok(())
    }

    fn state(&self) -> Result<DeviceState> {
        Ok(self.lock().state)
    }

    fn flush(&mut self) -> Result<()> {
        let Some(rs) = self.resampler.as_mut() else {
            return Ok(());
        };
        let tail = rs.flush()?;
        if tail.is_empty() {
            return Ok(());
        }
        let mut g = self.lock();
        match g.queued.back_mut() {
            Some(last) => last.samples.extend_from_slice(&tail),
            None => tracing::debug!(samples = tail.len(), "rate-converter tail dropped"),
        }
        Ok(())
    }
}

impl Drop for CpalQueueDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Interleaved little-endian PCM to `f32` in [-1, 1).
fn pcm_to_f32(pcm: &[u8], format: OutputFormat) -> Vec<f32> {
    match format.encoding() {
        SampleEncoding::Unsigned8 => pcm.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        _ => pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
            .collect(),
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: Arc<Mutex<DeviceQueue>>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(PlayerError::device(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<Mutex<DeviceQueue>>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let err_fn = |err| tracing::warn!("stream error: {err}");
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let mut q = shared.lock().unwrap_or_else(PoisonError::into_inner);
                q.render(data, channels_out);
            },
            err_fn,
            None,
        )
        .map_err(PlayerError::device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(channels: usize, buffers: &[(u32, Vec<f32>)]) -> DeviceQueue {
        let mut q = DeviceQueue::new();
        q.src_channels = channels;
        for (id, samples) in buffers {
            q.queued.push_back(QueuedBuffer {
                id: BufferId(*id),
                samples: samples.clone(),
            });
        }
        q.state = DeviceState::Playing;
        q
    }

    #[test]
    fn pcm_to_f32_handles_both_encodings() {
        let s16 = pcm_to_f32(&[0x00, 0x80, 0xff, 0x7f], OutputFormat::Mono16);
        assert_eq!(s16[0], -1.0);
        assert!((s16[1] - 32_767.0 / 32_768.0).abs() < 1e-6);

        let u8s = pcm_to_f32(&[0, 128, 255], OutputFormat::Stereo8);
        assert_eq!(u8s, vec![-1.0, 0.0, 127.0 / 128.0]);
    }

    #[test]
    fn render_plays_buffers_in_order_and_marks_processed() {
        let mut q = queue_with(1, &[(0, vec![0.1, 0.2]), (1, vec![0.3])]);
        let mut out = [0.0f32; 3];
        q.render(&mut out, 1);
        assert_eq!(out, [0.1, 0.2, 0.3]);
        assert_eq!(q.processed, VecDeque::from([BufferId(0)]));
        assert_eq!(q.state, DeviceState::Playing);

        let mut out = [1.0f32; 2];
        q.render(&mut out, 1);
        assert_eq!(out, [0.0, 0.0]);
        assert_eq!(q.processed, VecDeque::from([BufferId(0), BufferId(1)]));
        assert_eq!(q.state, DeviceState::Stopped);
    }

    #[test]
    fn render_while_paused_outputs_silence_without_draining() {
        let mut q = queue_with(1, &[(0, vec![0.5; 4])]);
        q.state = DeviceState::Paused;
        let mut out = [1.0f32; 4];
        q.render(&mut out, 1);
        assert_eq!(out, [0.0; 4]);
        assert_eq!(q.pos, 0);
        assert!(q.processed.is_empty());
    }

    #[test]
    fn render_maps_mono_to_stereo_and_back() {
        let mut q = queue_with(1, &[(0, vec![0.25, -0.25])]);
        let mut out = [0.0f32; 4];
        q.render(&mut out, 2);
        assert_eq!(out, [0.25, 0.25, -0.25, -0.25]);

        let mut q = queue_with(2, &[(0, vec![0.2, 0.4])]);
        let mut out = [0.0f32; 1];
        q.render(&mut out, 1);
        assert!((out[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn empty_buffer_is_retired_immediately() {
        let mut q = queue_with(1, &[(0, vec![]), (1, vec![0.7])]);
        let mut out = [0.0f32; 1];
        q.render(&mut out, 1);
        assert_eq!(out, [0.7]);
        assert_eq!(q.processed.front(), Some(&BufferId(0)));
    }

    #[test]
    fn stop_marks_everything_processed() {
        let mut q = queue_with(1, &[(3, vec![0.1; 8]), (4, vec![0.1; 8])]);
        q.pos = 5;
        q.stop();
        assert!(q.queued.is_empty());
        assert_eq!(q.processed.len(), 2);
        assert_eq!(q.pos, 0);
        assert_eq!(q.state, DeviceState::Stopped);
    }

    #[test]
    fn generated_buffers_have_distinct_ids() {
        let mut dev = CpalQueueDevice::new(None, 256);
        let first = dev.generate_buffers(3).unwrap();
        let second = dev.generate_buffers(2).unwrap();
        assert_eq!(first, vec![BufferId(0), BufferId(1), BufferId(2)]);
        assert_eq!(second, vec![BufferId(3), BufferId(4)]);
        assert!(dev.submit(BufferId(9), &[0, 0]).is_err());
    }
}
