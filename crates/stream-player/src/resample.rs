//! Streaming sample-rate conversion for devices that cannot run at the stream rate.
//!
//! Wraps Rubato's asynchronous sinc resampler with a fixed input chunk. Input arrives in
//! arbitrary lengths (one device buffer at a time), so frames that do not fill a whole chunk
//! are carried over to the next call.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{PlayerError, Result};

pub struct StreamResampler {
    inner: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    carry: Vec<f32>,
    scratch: Vec<f32>,
    ratio: f64,
}

impl StreamResampler {
    /// Convert interleaved `channels`-wide audio from `src_rate` to `dst_rate`.
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(PlayerError::Config(format!(
                "cannot resample {src_rate} Hz -> {dst_rate} Hz with {channels} channel(s)"
            )));
        }
        let ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let inner = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| PlayerError::device(format!("resampler init: {e}")))?;
        let scratch = vec![0.0f32; inner.output_frames_max() * channels];

        tracing::debug!(src_rate, dst_rate, channels, chunk_frames, "resampler ready");
        Ok(Self {
            inner: Box::new(inner),
            channels,
            chunk_frames,
            carry: Vec::with_capacity(chunk_frames * channels),
            scratch,
            ratio,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Input frames held back until a full chunk is available.
    pub fn pending_frames(&self) -> usize {
        self.carry.len() / self.channels
    }

    /// Feed interleaved samples and return whatever whole chunks produce.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let chunk_len = self.chunk_frames * self.channels;
        let mut out = Vec::with_capacity(
            ((input.len() + self.carry.len()) as f64 * self.ratio) as usize + chunk_len,
        );
        let mut rest = input;

        if !self.carry.is_empty() {
            let take = (chunk_len - self.carry.len()).min(rest.len());
            self.carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.carry.len() < chunk_len {
                return Ok(out);
            }
            let chunk = std::mem::take(&mut self.carry);
            self.run_chunk(&chunk, None, &mut out)?;
            self.carry = chunk;
            self.carry.clear();
        }

        while rest.len() >= chunk_len {
            let (chunk, tail) = rest.split_at(chunk_len);
            self.run_chunk(chunk, None, &mut out)?;
            rest = tail;
        }
        self.carry.extend_from_slice(rest);
        Ok(out)
    }

    /// Push the carried partial chunk through as a final short chunk.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let frames = self.pending_frames();
        let mut out = Vec::new();
        if frames == 0 {
            return Ok(out);
        }
        let mut chunk = std::mem::take(&mut self.carry);
        chunk.resize(self.chunk_frames * self.channels, 0.0);
        self.run_chunk(&chunk, Some(frames), &mut out)?;
        chunk.clear();
        self.carry = chunk;
        Ok(out)
    }

    /// Drop carried input and filter history, e.g. after a rewind.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.inner.reset();
    }

    fn run_chunk(&mut self, chunk: &[f32], partial: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let input = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
            .map_err(|e| PlayerError::device(format!("resampler input: {e}")))?;
        let out_frames = self.scratch.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.scratch, self.channels, out_frames)
            .map_err(|e| PlayerError::device(format!("resampler output: {e}")))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial,
        };
        let (_consumed, produced) = self
            .inner
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| PlayerError::device(format!("resampler: {e}")))?;
        out.extend_from_slice(&self.scratch[..produced * self.channels]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_rates() {
        assert!(StreamResampler::new(0, 48_000, 2, 256).is_err());
        assert!(StreamResampler::new(44_100, 48_000, 0, 256).is_err());
    }

    #[test]
    fn short_input_is_carried() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 256).unwrap();
        let out = rs.process(&vec![0.1; 100 * 2]).unwrap();
        assert!(out.is_empty());
        assert_eq!(rs.pending_frames(), 100);
        rs.reset();
        assert_eq!(rs.pending_frames(), 0);
    }

    #[test]
    fn output_length_tracks_ratio() {
        let mut rs = StreamResampler::new(24_000, 48_000, 1, 512).unwrap();
        let mut total = 0usize;
        for _ in 0..40 {
            total += rs.process(&vec![0.25; 512]).unwrap().len();
        }
        total += rs.flush().unwrap().len();
        let expected = 40 * 512 * 2;
        // The sinc filter delays output by a fraction of a chunk.
        assert!(total <= expected + 512, "total={total}");
        assert!(total > expected - 2 * 512 * 2, "total={total}");
    }

    #[test]
    fn output_stays_interleaved() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 256).unwrap();
        let out = rs.process(&vec![0.5; 2048 * 2]).unwrap();
        assert_eq!(out.len() % 2, 0);
        assert!(!out.is_empty());
    }
}
