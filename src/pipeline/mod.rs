//! The pull-based DSP pipeline between the application and the endpoint.
//!
//! A [`Pipeline`] adapts one stream description (format, channel count,
//! channel map, sample rate) to another. It is a *puller*: the consumer asks
//! it for N output frames and the pipeline requests whatever input it needs
//! from an upstream [`FrameSource`]. For playback the upstream is the
//! application callback and the consumer is the endpoint; for capture the
//! upstream is the endpoint region and the consumer is the delivery path.
//!
//! Work happens in bounded chunks so the staging buffers stay small no matter
//! how large a request is. When the two stream descriptions match exactly the
//! pipeline detects passthrough and delegates straight to the upstream.

use crate::error::DeviceError;
use crate::format::channel::{self, Channel, MixMode};
use crate::format::resample::{FrameSource, ResampleAlgorithm, Resampler, ResamplerConfig};
use crate::format::{self, AlignedScratch, SampleFormat, MAX_SAMPLE_SIZE};

/// Byte budget for one staging chunk across all staging buffers.
const CHUNK_BUDGET_BYTES: usize = 4096;

/// One side of a pipeline: the full stream description.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Sample format.
    pub format: SampleFormat,
    /// Interleaved channel count.
    pub channels: usize,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel map; empty means "unknown layout", which disables remapping.
    pub channel_map: Vec<Channel>,
}

impl StreamSpec {
    /// Creates a spec with the default channel map for `channels`.
    #[must_use]
    pub fn new(format: SampleFormat, channels: usize, sample_rate: u32) -> Self {
        Self {
            format,
            channels,
            sample_rate,
            channel_map: channel::default_channel_map(channels as u16),
        }
    }

    /// Size of one interleaved frame in bytes.
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        self.channels * self.format.bytes_per_sample()
    }
}

/// Pull-based converter between two stream descriptions.
pub struct Pipeline {
    input: StreamSpec,
    output: StreamSpec,
    resampler: Option<Resampler>,
    is_src_required: bool,
    is_channel_mapping_required: bool,
    is_passthrough: bool,
    /// Permutation applied per frame when remapping; empty otherwise.
    shuffle: Vec<usize>,
    chunk_frames: usize,
    stage: AlignedScratch,
    mix_in: Vec<f32>,
    mix_out: Vec<f32>,
}

impl Pipeline {
    /// Builds a pipeline converting from `input` to `output`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidConfig`] when either spec is out of
    /// range, or when the rates differ and the resampler rejects them.
    pub fn new(input: StreamSpec, output: StreamSpec) -> Result<Self, DeviceError> {
        for spec in [&input, &output] {
            if spec.channels == 0 || spec.channels > channel::MAX_CHANNELS {
                return Err(DeviceError::invalid_config(format!(
                    "channel count {} is out of range 1..={}",
                    spec.channels,
                    channel::MAX_CHANNELS
                )));
            }
            if spec.sample_rate == 0 {
                return Err(DeviceError::invalid_config("sample rate must be positive"));
            }
            if !spec.channel_map.is_empty() && spec.channel_map.len() != spec.channels {
                return Err(DeviceError::invalid_config(
                    "channel map length must match the channel count",
                ));
            }
        }

        let is_src_required = input.sample_rate != output.sample_rate;
        let resampler = if is_src_required {
            Some(Resampler::new(ResamplerConfig {
                format_in: input.format,
                format_out: SampleFormat::F32,
                channels: input.channels,
                rate_in: input.sample_rate,
                rate_out: output.sample_rate,
                cache_frames: 0,
                algorithm: ResampleAlgorithm::Linear,
            })?)
        } else {
            None
        };

        let mut shuffle = Vec::new();
        let maps_usable = !input.channel_map.is_empty()
            && !output.channel_map.is_empty()
            && input.channel_map.iter().any(|c| *c != Channel::None)
            && output.channel_map.iter().any(|c| *c != Channel::None);
        if maps_usable {
            let post_mix = channel::extend_map(&input.channel_map, &output.channel_map);
            if post_mix != output.channel_map {
                if let Some(table) = channel::shuffle_table(&post_mix, &output.channel_map) {
                    shuffle = table;
                }
            }
        }
        let is_channel_mapping_required = !shuffle.is_empty();

        let is_passthrough = input.format == output.format
            && input.channels == output.channels
            && !is_src_required
            && !is_channel_mapping_required;

        let widest = input.channels.max(output.channels);
        let chunk_frames = (CHUNK_BUDGET_BYTES / (widest * MAX_SAMPLE_SIZE)).max(1);

        let stage_bytes = if is_passthrough {
            0
        } else {
            chunk_frames * input.bytes_per_frame()
        };
        let mix_in = vec![0.0f32; chunk_frames * input.channels];
        let mix_out = vec![0.0f32; chunk_frames * output.channels];

        Ok(Self {
            input,
            output,
            resampler,
            is_src_required,
            is_channel_mapping_required,
            is_passthrough,
            shuffle,
            chunk_frames,
            stage: AlignedScratch::new(stage_bytes),
            mix_in,
            mix_out,
        })
    }

    /// The input (upstream-side) stream description.
    pub fn input(&self) -> &StreamSpec {
        &self.input
    }

    /// The output (consumer-side) stream description.
    pub fn output(&self) -> &StreamSpec {
        &self.output
    }

    /// True when a sample rate converter is in the path.
    pub fn is_src_required(&self) -> bool {
        self.is_src_required
    }

    /// True when frames are permuted between channel positions.
    pub fn is_channel_mapping_required(&self) -> bool {
        self.is_channel_mapping_required
    }

    /// True when reads delegate directly to the upstream source.
    pub fn is_passthrough(&self) -> bool {
        self.is_passthrough
    }

    /// Rewinds stream-position state (the resampler cache) for reuse.
    pub fn reset(&mut self) {
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
    }

    /// Pulls up to `frames` output frames into `out`.
    ///
    /// Returns the number of frames written. Fewer than requested means the
    /// upstream source is exhausted for now.
    pub fn read(&mut self, out: &mut [u8], frames: usize, upstream: &mut FrameSource<'_>) -> usize {
        if self.is_passthrough {
            return upstream(out, frames);
        }

        let bpf_out = self.output.bytes_per_frame();
        let mut total = 0;
        while total < frames {
            let want = (frames - total).min(self.chunk_frames);
            let got = self.read_chunk(&mut out[total * bpf_out..], want, upstream);
            total += got;
            if got < want {
                break;
            }
        }
        total
    }

    fn read_chunk(
        &mut self,
        out: &mut [u8],
        frames: usize,
        upstream: &mut FrameSource<'_>,
    ) -> usize {
        let ch_in = self.input.channels;
        let ch_out = self.output.channels;

        // Stage: either the resampler hands us f32 directly, or the upstream
        // delivers raw input-format bytes.
        let got = if let Some(resampler) = &mut self.resampler {
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.mix_in[..frames * ch_in]);
            resampler.read(bytes, frames, upstream)
        } else {
            let bpf_in = self.input.bytes_per_frame();
            upstream(&mut self.stage.as_bytes_mut()[..frames * bpf_in], frames)
        };
        if got == 0 {
            return 0;
        }

        let needs_f32 = ch_in != ch_out || self.is_channel_mapping_required;
        if needs_f32 && !self.is_src_required {
            format::to_f32(
                &mut self.mix_in,
                self.stage.as_bytes(),
                self.input.format,
                got * ch_in,
            );
        }

        if ch_in != ch_out {
            channel::remix(
                &mut self.mix_out,
                ch_out,
                &self.mix_in,
                ch_in,
                got,
                MixMode::Blend,
            );
        }
        let current: &mut [f32] = if ch_in != ch_out {
            &mut self.mix_out
        } else {
            &mut self.mix_in
        };

        if self.is_channel_mapping_required {
            channel::apply_shuffle(current, ch_out, got, &self.shuffle);
        }

        if needs_f32 || self.is_src_required {
            format::from_f32(out, self.output.format, &current[..got * ch_out], got * ch_out);
        } else {
            // Format-only path: convert pairwise so integer formats stay
            // bit-exact instead of bouncing through f32.
            format::convert(
                out,
                self.output.format,
                self.stage.as_bytes(),
                self.input.format,
                got * ch_in,
            );
        }
        got
    }
}
