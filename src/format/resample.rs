//! Pull-based sample rate conversion.
//!
//! The resampler sits between an upstream frame source (the application
//! callback, usually) and a consumer that wants frames at a different rate.
//! Upstream data is staged through a small f32 [`FrameCache`] so the linear
//! interpolator can fetch one frame at a time without hammering the callback,
//! and converted to the output format as frames are produced.
//!
//! Only nearest (`None`) and `Linear` algorithms exist. Higher-quality
//! resampling belongs to a dedicated DSP crate, not a device library.

use crate::error::DeviceError;
use crate::format::channel::MAX_CHANNELS;
use crate::format::{self, AlignedScratch, SampleFormat};

/// An upstream producer of interleaved frames.
///
/// Implementations write up to `frames` frames into the byte buffer (in the
/// format agreed at construction) and return how many frames they produced.
/// Returning less than `frames` signals exhaustion.
pub type FrameSource<'a> = dyn FnMut(&mut [u8], usize) -> usize + 'a;

/// Largest number of frames the cache will stage at once.
pub const MAX_CACHE_FRAMES: usize = 512;

/// Resampling algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleAlgorithm {
    /// No rate conversion; frames pass through with format conversion only.
    None,
    /// Two-point linear interpolation.
    #[default]
    Linear,
}

/// Configuration for a [`Resampler`].
#[derive(Debug, Clone)]
pub struct ResamplerConfig {
    /// Format delivered by the upstream source.
    pub format_in: SampleFormat,
    /// Format written to the output buffer.
    pub format_out: SampleFormat,
    /// Interleaved channel count (same on both sides).
    pub channels: usize,
    /// Upstream sample rate in Hz.
    pub rate_in: u32,
    /// Output sample rate in Hz.
    pub rate_out: u32,
    /// Cache capacity in frames; 0 picks the maximum.
    pub cache_frames: usize,
    /// Interpolation algorithm.
    pub algorithm: ResampleAlgorithm,
}

/// Bounded staging buffer between the upstream source and the interpolator.
///
/// Frames are stored interleaved as f32. A refill asks upstream for a full
/// cache worth of frames; exhaustion is reported by returning fewer frames
/// than requested.
struct FrameCache {
    format_in: SampleFormat,
    channels: usize,
    capacity: usize,
    frames: Vec<f32>,
    scratch: AlignedScratch,
    len: usize,
    cursor: usize,
}

impl FrameCache {
    fn new(format_in: SampleFormat, channels: usize, capacity: usize) -> Self {
        let scratch_bytes = if format_in == SampleFormat::F32 {
            0
        } else {
            capacity * channels * format_in.bytes_per_sample()
        };
        Self {
            format_in,
            channels,
            capacity,
            frames: vec![0.0; capacity * channels],
            scratch: AlignedScratch::new(scratch_bytes),
            len: 0,
            cursor: 0,
        }
    }

    fn reset(&mut self) {
        self.len = 0;
        self.cursor = 0;
    }

    /// Reads up to `frames` f32 frames into `out`, refilling from upstream as
    /// needed. Returns the number of frames delivered; fewer than requested
    /// means upstream is exhausted.
    fn read(&mut self, out: &mut [f32], frames: usize, upstream: &mut FrameSource<'_>) -> usize {
        let ch = self.channels;
        let mut total = 0;

        while total < frames {
            if self.cursor < self.len {
                let take = (frames - total).min(self.len - self.cursor);
                let src = &self.frames[self.cursor * ch..(self.cursor + take) * ch];
                out[total * ch..(total + take) * ch].copy_from_slice(src);
                self.cursor += take;
                total += take;
                continue;
            }

            let want = self.capacity;
            let got = if self.format_in == SampleFormat::F32 {
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.frames[..want * ch]);
                upstream(bytes, want)
            } else {
                let bps = self.format_in.bytes_per_sample();
                let got = upstream(&mut self.scratch.as_bytes_mut()[..want * ch * bps], want);
                format::to_f32(
                    &mut self.frames,
                    self.scratch.as_bytes(),
                    self.format_in,
                    got * ch,
                );
                got
            };
            self.len = got.min(want);
            self.cursor = 0;
            if self.len == 0 {
                break;
            }
        }
        debug_assert!(self.cursor <= self.len);
        total
    }
}

/// Pull-based sample rate converter.
pub struct Resampler {
    config: ResamplerConfig,
    ratio: f64,
    alpha: f64,
    prev: [f32; MAX_CHANNELS],
    next: [f32; MAX_CHANNELS],
    bin_loaded: bool,
    drained: bool,
    final_in_prev: bool,
    cache: FrameCache,
    passthrough_scratch: AlignedScratch,
}

impl Resampler {
    /// Creates a resampler for the given configuration.
    ///
    /// Equal input and output rates downgrade the algorithm to
    /// [`ResampleAlgorithm::None`], leaving only format conversion.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidConfig`] if either rate is zero, the
    /// channel count is out of range, or the cache size exceeds
    /// [`MAX_CACHE_FRAMES`].
    pub fn new(mut config: ResamplerConfig) -> Result<Self, DeviceError> {
        if config.rate_in == 0 || config.rate_out == 0 {
            return Err(DeviceError::invalid_config("sample rate must be positive"));
        }
        if config.channels == 0 || config.channels > MAX_CHANNELS {
            return Err(DeviceError::invalid_config(format!(
                "channel count {} is out of range 1..={MAX_CHANNELS}",
                config.channels
            )));
        }
        if config.cache_frames > MAX_CACHE_FRAMES {
            return Err(DeviceError::invalid_config(format!(
                "cache size {} exceeds {MAX_CACHE_FRAMES} frames",
                config.cache_frames
            )));
        }
        if config.cache_frames == 0 {
            config.cache_frames = MAX_CACHE_FRAMES;
        }
        if config.rate_in == config.rate_out {
            config.algorithm = ResampleAlgorithm::None;
        }

        let ratio = f64::from(config.rate_in) / f64::from(config.rate_out);
        let cache = FrameCache::new(config.format_in, config.channels, config.cache_frames);
        let passthrough_bytes = if config.algorithm == ResampleAlgorithm::None
            && config.format_in != config.format_out
        {
            config.cache_frames * config.channels * config.format_in.bytes_per_sample()
        } else {
            0
        };
        let passthrough_scratch = AlignedScratch::new(passthrough_bytes);

        Ok(Self {
            config,
            ratio,
            alpha: 0.0,
            prev: [0.0; MAX_CHANNELS],
            next: [0.0; MAX_CHANNELS],
            bin_loaded: false,
            drained: false,
            final_in_prev: false,
            cache,
            passthrough_scratch,
        })
    }

    /// The configuration this resampler was built with.
    pub fn config(&self) -> &ResamplerConfig {
        &self.config
    }

    /// Rewinds all interpolation state so the resampler can be reused for a
    /// fresh stream.
    pub fn reset(&mut self) {
        self.alpha = 0.0;
        self.prev = [0.0; MAX_CHANNELS];
        self.next = [0.0; MAX_CHANNELS];
        self.bin_loaded = false;
        self.drained = false;
        self.final_in_prev = false;
        self.cache.reset();
    }

    /// Produces up to `frames` output frames into `out`.
    ///
    /// Returns the number of frames written. Fewer than requested means the
    /// upstream source is exhausted for now; the interpolation bin is
    /// unloaded and reloads from whatever the source yields next.
    pub fn read(&mut self, out: &mut [u8], frames: usize, upstream: &mut FrameSource<'_>) -> usize {
        match self.config.algorithm {
            ResampleAlgorithm::None => self.read_passthrough(out, frames, upstream),
            ResampleAlgorithm::Linear => self.read_linear(out, frames, upstream),
        }
    }

    fn read_passthrough(
        &mut self,
        out: &mut [u8],
        frames: usize,
        upstream: &mut FrameSource<'_>,
    ) -> usize {
        let ch = self.config.channels;
        if self.config.format_in == self.config.format_out {
            return upstream(out, frames);
        }

        let bps_in = self.config.format_in.bytes_per_sample();
        let bps_out = self.config.format_out.bytes_per_sample();
        let chunk = self.config.cache_frames;
        let mut total = 0;
        while total < frames {
            let want = (frames - total).min(chunk);
            let got = upstream(
                &mut self.passthrough_scratch.as_bytes_mut()[..want * ch * bps_in],
                want,
            );
            format::convert(
                &mut out[total * ch * bps_out..],
                self.config.format_out,
                self.passthrough_scratch.as_bytes(),
                self.config.format_in,
                got * ch,
            );
            total += got;
            if got < want {
                break;
            }
        }
        total
    }

    /// Forgets the current/next frame pair so the next read starts fresh
    /// from whatever the source yields.
    fn unload_bin(&mut self) {
        self.bin_loaded = false;
        self.drained = false;
        self.final_in_prev = false;
    }

    fn read_linear(
        &mut self,
        out: &mut [u8],
        frames: usize,
        upstream: &mut FrameSource<'_>,
    ) -> usize {
        let ch = self.config.channels;
        let bps_out = self.config.format_out.bytes_per_sample();
        let mut frame = [0.0f32; MAX_CHANNELS];

        if !self.bin_loaded {
            let mut pair = [0.0f32; MAX_CHANNELS * 2];
            let got = self.cache.read(&mut pair[..ch * 2], 2, upstream);
            match got {
                0 => return 0,
                1 => {
                    // A single upstream frame cannot be interpolated; emit it
                    // as-is and wait for more input.
                    format::from_f32(out, self.config.format_out, &pair[..ch], ch);
                    return 1;
                }
                _ => {
                    self.prev[..ch].copy_from_slice(&pair[..ch]);
                    self.next[..ch].copy_from_slice(&pair[ch..ch * 2]);
                    self.alpha = 0.0;
                    self.bin_loaded = true;
                }
            }
        }

        let mut produced = 0;
        while produced < frames {
            if self.drained {
                // The final upstream frame sits in `prev`. It is emitted only
                // if the output grid lands exactly on it; anything past that
                // would be interpolation against silence.
                if self.alpha == 0.0 && self.final_in_prev {
                    format::from_f32(
                        &mut out[produced * ch * bps_out..],
                        self.config.format_out,
                        &self.prev[..ch],
                        ch,
                    );
                    produced += 1;
                }
                self.unload_bin();
                break;
            }

            let alpha = self.alpha as f32;
            for c in 0..ch {
                frame[c] = self.prev[c] * (1.0 - alpha) + self.next[c] * alpha;
            }
            format::from_f32(
                &mut out[produced * ch * bps_out..],
                self.config.format_out,
                &frame[..ch],
                ch,
            );
            produced += 1;

            self.alpha += self.ratio;
            while self.alpha >= 1.0 {
                self.alpha -= 1.0;
                self.prev = self.next;
                if self.drained {
                    // Shifted past the last real frame; the grid skipped it.
                    self.final_in_prev = false;
                    continue;
                }
                let got = self.cache.read(&mut frame[..ch], 1, upstream);
                if got == 0 {
                    self.next[..ch].fill(0.0);
                    self.drained = true;
                    self.final_in_prev = true;
                } else {
                    self.next[..ch].copy_from_slice(&frame[..ch]);
                }
            }
        }
        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wraps a vec of f32 frames as a `FrameSource` yielding f32 bytes.
    fn f32_source(samples: Vec<f32>, channels: usize) -> impl FnMut(&mut [u8], usize) -> usize {
        let mut offset = 0;
        move |out: &mut [u8], frames: usize| {
            let available = (samples.len() - offset) / channels;
            let give = frames.min(available);
            let src = &samples[offset..offset + give * channels];
            out[..give * channels * 4].copy_from_slice(bytemuck::cast_slice(src));
            offset += give * channels;
            give
        }
    }

    fn f32_from(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    fn read_all_f32(resampler: &mut Resampler, upstream: &mut FrameSource<'_>) -> Vec<f32> {
        let ch = resampler.config().channels;
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 64 * ch * 4];
        loop {
            let got = resampler.read(&mut buf, 64, upstream);
            if got == 0 {
                break;
            }
            collected.extend(f32_from(&buf[..got * ch * 4]));
        }
        collected
    }

    fn linear_config(rate_in: u32, rate_out: u32, channels: usize) -> ResamplerConfig {
        ResamplerConfig {
            format_in: SampleFormat::F32,
            format_out: SampleFormat::F32,
            channels,
            rate_in,
            rate_out,
            cache_frames: 0,
            algorithm: ResampleAlgorithm::Linear,
        }
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(Resampler::new(linear_config(0, 48000, 1)).is_err());
        assert!(Resampler::new(linear_config(48000, 0, 1)).is_err());
    }

    #[test]
    fn test_equal_rates_downgrade_to_passthrough() {
        let resampler = Resampler::new(linear_config(48000, 48000, 2)).unwrap();
        assert_eq!(resampler.config().algorithm, ResampleAlgorithm::None);
    }

    #[test]
    fn test_passthrough_is_byte_identical() {
        let mut resampler = Resampler::new(linear_config(44100, 44100, 1)).unwrap();
        let input = vec![0.1f32, -0.2, 0.3, -0.4];
        let mut upstream = f32_source(input.clone(), 1);
        let out = read_all_f32(&mut resampler, &mut upstream);
        assert_eq!(out, input);
    }

    #[test]
    fn test_passthrough_converts_format() {
        let mut config = linear_config(44100, 44100, 1);
        config.format_out = SampleFormat::S16;
        let mut resampler = Resampler::new(config).unwrap();

        let mut upstream = f32_source(vec![0.5f32, -0.5], 1);
        let mut out = [0u8; 4];
        let got = resampler.read(&mut out, 2, &mut upstream);
        assert_eq!(got, 2);
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![16383, -16383]);
    }

    #[test]
    fn test_upsample_doubles_with_midpoints() {
        let mut resampler = Resampler::new(linear_config(1, 2, 1)).unwrap();
        let mut upstream = f32_source(vec![0.0, 1.0, 2.0, 3.0], 1);
        let out = read_all_f32(&mut resampler, &mut upstream);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);
    }

    #[test]
    fn test_exhausted_source_yields_zero() {
        let mut resampler = Resampler::new(linear_config(1, 2, 1)).unwrap();
        let mut upstream = f32_source(vec![0.0, 1.0], 1);
        let mut buf = [0u8; 16 * 4];
        let first = resampler.read(&mut buf, 16, &mut upstream);
        assert_eq!(first, 3); // 0.0, 0.5, 1.0
        assert_eq!(resampler.read(&mut buf, 16, &mut upstream), 0);
    }

    #[test]
    fn test_interpolation_resumes_after_a_stall() {
        // A source that runs dry mid-stream (a capture period boundary)
        // unloads the bin; fresh input reloads it and output continues.
        let mut resampler = Resampler::new(linear_config(1, 2, 1)).unwrap();
        let mut buf = [0u8; 16 * 4];

        let mut first_burst = f32_source(vec![0.0, 1.0], 1);
        assert_eq!(resampler.read(&mut buf, 16, &mut first_burst), 3);

        let mut second_burst = f32_source(vec![2.0, 4.0], 1);
        let got = resampler.read(&mut buf, 16, &mut second_burst);
        assert_eq!(got, 3);
        assert_eq!(f32_from(&buf[..got * 4]), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_single_frame_input_is_emitted_once() {
        let mut resampler = Resampler::new(linear_config(1, 4, 1)).unwrap();
        let mut upstream = f32_source(vec![0.75], 1);
        let mut buf = [0u8; 8 * 4];
        assert_eq!(resampler.read(&mut buf, 8, &mut upstream), 1);
        assert_eq!(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 0.75);
        assert_eq!(resampler.read(&mut buf, 8, &mut upstream), 0);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let mut resampler = Resampler::new(linear_config(2, 1, 1)).unwrap();
        let mut upstream = f32_source(vec![], 1);
        let mut buf = [0u8; 4];
        assert_eq!(resampler.read(&mut buf, 1, &mut upstream), 0);
    }

    #[test]
    fn test_constant_stream_stays_constant() {
        for (rate_in, rate_out) in [(44100u32, 48000u32), (48000, 44100), (8000, 192000)] {
            let mut resampler = Resampler::new(linear_config(rate_in, rate_out, 2)).unwrap();
            let input = vec![0.123f32; 2 * 256];
            let mut upstream = f32_source(input, 2);
            let out = read_all_f32(&mut resampler, &mut upstream);
            assert!(!out.is_empty());
            for sample in out {
                assert!(
                    (sample - 0.123).abs() <= f32::EPSILON,
                    "constant drifted at {rate_in}->{rate_out}: {sample}"
                );
            }
        }
    }

    #[test]
    fn test_downsample_halves_frame_count() {
        let mut resampler = Resampler::new(linear_config(2, 1, 1)).unwrap();
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let mut upstream = f32_source(input, 1);
        let out = read_all_f32(&mut resampler, &mut upstream);
        // Every output frame advances two input frames.
        assert!(out.len() >= 49 && out.len() <= 51, "got {}", out.len());
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 2.0);
        assert_eq!(out[2], 4.0);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut resampler = Resampler::new(linear_config(1, 2, 1)).unwrap();
        let mut upstream = f32_source(vec![0.0, 1.0], 1);
        let mut buf = [0u8; 8 * 4];
        resampler.read(&mut buf, 8, &mut upstream);
        assert_eq!(resampler.read(&mut buf, 8, &mut upstream), 0);

        resampler.reset();
        let mut upstream = f32_source(vec![4.0, 6.0], 1);
        let got = resampler.read(&mut buf, 8, &mut upstream);
        assert_eq!(f32_from(&buf[..got * 4]), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_integer_upstream_is_converted() {
        let mut config = linear_config(1, 2, 1);
        config.format_in = SampleFormat::S16;
        let mut resampler = Resampler::new(config).unwrap();

        let pcm: Vec<u8> = [0i16, 16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut offset = 0;
        let mut upstream = move |out: &mut [u8], frames: usize| {
            let available = (pcm.len() - offset) / 2;
            let give = frames.min(available);
            out[..give * 2].copy_from_slice(&pcm[offset..offset + give * 2]);
            offset += give * 2;
            give
        };

        let mut buf = [0u8; 8 * 4];
        let got = resampler.read(&mut buf, 8, &mut upstream);
        assert_eq!(got, 3);
        let samples = f32_from(&buf[..12]);
        // s16 zero maps to ~0, 16384 to ~0.5; the midpoint sits between.
        assert!(samples[0].abs() < 1e-4);
        assert!((samples[1] - 0.25).abs() < 1e-3);
        assert!((samples[2] - 0.5).abs() < 1e-3);
    }
}
