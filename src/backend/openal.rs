//! OpenAL backend (feature `openal`).
//!
//! A fallback for hosts where no native backend is compiled in but an OpenAL
//! runtime exists. Playback streams through a queue of period-sized buffers
//! on a streaming source; capture drains the implementation's ring. OpenAL's
//! classic buffer formats stop at stereo 16-bit, so the endpoint negotiates
//! down to that and lets the pipeline bridge the difference.
//!
//! The `alto` wrapper locates the OpenAL library at runtime, which keeps this
//! backend buildable on hosts without OpenAL installed.

use std::ffi::CString;

use alto::{Alto, Capture, Context, Mono, OutputDevice, Source, SourceState, Stereo,
    StreamingSource};

use crate::backend::{
    Backend, BackendKind, DeviceId, DeviceInfo, Endpoint, EndpointConfig, Interrupter, Logger,
};
use crate::config::{ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::channel::default_channel_map;
use crate::format::resample::FrameSource;
use crate::format::{AlignedScratch, SampleFormat};
use crate::pipeline::StreamSpec;

/// Queue depth is the period count; OpenAL gains nothing beyond four.
const MAX_PERIODS: usize = 4;

fn al_err(context: &str, error: alto::AltoError) -> DeviceError {
    DeviceError::Backend {
        backend: BackendKind::OpenAl,
        message: format!("{context}: {error}"),
    }
}

pub(crate) struct OpenAlBackend {
    alto: Alto,
}

impl OpenAlBackend {
    pub(crate) fn new() -> Result<Self, DeviceError> {
        let alto = Alto::load_default().map_err(|_| DeviceError::ApiNotFound {
            api: "OpenAL".to_string(),
        })?;
        Ok(Self { alto })
    }
}

impl Backend for OpenAlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAl
    }

    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        let names = match mode {
            StreamMode::Playback => self.alto.enumerate_outputs(),
            StreamMode::Capture => self.alto.enumerate_captures(),
        };
        let default = match mode {
            StreamMode::Playback => self.alto.default_output().ok(),
            StreamMode::Capture => self.alto.default_capture().ok(),
        };

        Ok(names
            .into_iter()
            .map(|name| {
                let utf8 = name.to_string_lossy().into_owned();
                DeviceInfo {
                    is_default: default.as_deref() == Some(name.as_c_str()),
                    id: DeviceId::OpenAl(utf8.clone()),
                    name: utf8,
                }
            })
            .collect())
    }

    fn open(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &ResolvedConfig,
        logger: Logger,
    ) -> Result<Box<dyn Endpoint>, DeviceError> {
        let specifier = match device {
            None => None,
            Some(DeviceId::OpenAl(name)) => {
                Some(CString::new(name.as_str()).map_err(|_| DeviceError::NoDevice)?)
            }
            Some(_) => return Err(DeviceError::NoDevice),
        };

        // Classic OpenAL buffer formats: mono/stereo, 8/16 bit. Everything
        // else is bridged by the pipeline.
        let channels = config.spec.channels.min(2);
        let spec = StreamSpec {
            format: SampleFormat::S16,
            channels,
            sample_rate: config.spec.sample_rate,
            channel_map: default_channel_map(channels as u16),
        };
        let periods = config.periods.min(MAX_PERIODS);
        let period_frames = (config.buffer_frames / periods).max(1);
        let buffer_frames = period_frames * periods;

        let endpoint_config = EndpointConfig {
            mode,
            spec,
            buffer_frames,
            periods,
        };

        let stream = match mode {
            StreamMode::Playback => {
                let device = self
                    .alto
                    .open(specifier.as_deref())
                    .map_err(|_| DeviceError::NoDevice)?;
                let context = device
                    .new_context(None)
                    .map_err(|e| al_err("context", e))?;
                let source = context
                    .new_streaming_source()
                    .map_err(|e| al_err("source", e))?;
                AlStream::Playback {
                    _device: device,
                    context,
                    source,
                    queued: 0,
                }
            }
            StreamMode::Capture => {
                let rate = endpoint_config.spec.sample_rate;
                let len = buffer_frames as i32;
                match channels {
                    1 => AlStream::CaptureMono(
                        self.alto
                            .open_capture::<Mono<i16>>(specifier.as_deref(), rate, len)
                            .map_err(|_| DeviceError::NoDevice)?,
                    ),
                    _ => AlStream::CaptureStereo(
                        self.alto
                            .open_capture::<Stereo<i16>>(specifier.as_deref(), rate, len)
                            .map_err(|_| DeviceError::NoDevice)?,
                    ),
                }
            }
        };

        logger.log(&format!(
            "opened endpoint: {} {} ch {} Hz, {} frames x {} periods",
            endpoint_config.spec.format,
            endpoint_config.spec.channels,
            endpoint_config.spec.sample_rate,
            endpoint_config.buffer_frames,
            endpoint_config.periods,
        ));

        let scratch = AlignedScratch::new(period_frames * endpoint_config.spec.bytes_per_frame());
        Ok(Box::new(OpenAlEndpoint {
            config: endpoint_config,
            stream,
            scratch,
            interrupter: Interrupter::new(),
            logger,
        }))
    }
}

enum AlStream {
    Playback {
        _device: OutputDevice,
        context: Context,
        source: StreamingSource,
        queued: usize,
    },
    CaptureMono(Capture<Mono<i16>>),
    CaptureStereo(Capture<Stereo<i16>>),
}

pub(crate) struct OpenAlEndpoint {
    config: EndpointConfig,
    stream: AlStream,
    /// One period of staging, in the endpoint's s16 wire layout.
    scratch: AlignedScratch,
    interrupter: Interrupter,
    logger: Logger,
}

impl OpenAlEndpoint {
    /// Queues the staged period, reusing a processed buffer when available.
    fn queue_scratch(&mut self) -> Result<(), DeviceError> {
        let rate = self.config.spec.sample_rate as i32;
        let channels = self.config.spec.channels;
        let samples: &[i16] = bytemuck::cast_slice(self.scratch.as_bytes());

        let AlStream::Playback {
            context,
            source,
            queued,
            ..
        } = &mut self.stream
        else {
            return Ok(());
        };

        let reusable = source.buffers_processed() > 0;
        if reusable {
            let mut buffer = source.unqueue_buffer().map_err(|e| al_err("unqueue", e))?;
            if channels == 1 {
                let frames: Vec<Mono<i16>> = samples.iter().map(|&s| Mono { center: s }).collect();
                buffer
                    .set_data(frames.as_slice(), rate)
                    .map_err(|e| al_err("buffer data", e))?;
            } else {
                let frames: Vec<Stereo<i16>> = samples
                    .chunks_exact(2)
                    .map(|p| Stereo {
                        left: p[0],
                        right: p[1],
                    })
                    .collect();
                buffer
                    .set_data(frames.as_slice(), rate)
                    .map_err(|e| al_err("buffer data", e))?;
            }
            source.queue_buffer(buffer).map_err(|e| al_err("queue", e))?;
        } else {
            let buffer = if channels == 1 {
                let frames: Vec<Mono<i16>> = samples.iter().map(|&s| Mono { center: s }).collect();
                context
                    .new_buffer(frames.as_slice(), rate)
                    .map_err(|e| al_err("buffer", e))?
            } else {
                let frames: Vec<Stereo<i16>> = samples
                    .chunks_exact(2)
                    .map(|p| Stereo {
                        left: p[0],
                        right: p[1],
                    })
                    .collect();
                context
                    .new_buffer(frames.as_slice(), rate)
                    .map_err(|e| al_err("buffer", e))?
            };
            source.queue_buffer(buffer).map_err(|e| al_err("queue", e))?;
            *queued += 1;
        }

        // A starved source stops on its own; requeueing is the recovery.
        if source.state() != SourceState::Playing {
            source.play();
        }
        Ok(())
    }

    fn drain_capture(&mut self, frames: usize) -> Result<(), DeviceError> {
        let samples: &mut [i16] = bytemuck::cast_slice_mut(self.scratch.as_bytes_mut());
        match &mut self.stream {
            AlStream::CaptureMono(capture) => {
                let mut staging = vec![Mono { center: 0i16 }; frames];
                capture
                    .capture_samples(&mut staging)
                    .map_err(|e| al_err("capture", e))?;
                for (out, frame) in samples.iter_mut().zip(staging.iter()) {
                    *out = frame.center;
                }
            }
            AlStream::CaptureStereo(capture) => {
                let mut staging = vec![
                    Stereo {
                        left: 0i16,
                        right: 0i16
                    };
                    frames
                ];
                capture
                    .capture_samples(&mut staging)
                    .map_err(|e| al_err("capture", e))?;
                for (out, frame) in samples.chunks_exact_mut(2).zip(staging.iter()) {
                    out[0] = frame.left;
                    out[1] = frame.right;
                }
            }
            AlStream::Playback { .. } => {}
        }
        Ok(())
    }
}

impl Endpoint for OpenAlEndpoint {
    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError> {
        match self.config.mode {
            StreamMode::Playback => {
                // Pre-roll: one pull per queue slot fills the whole endpoint
                // buffer before playback begins.
                let period = self.config.period_frames();
                let bytes = period * self.config.spec.bytes_per_frame();
                for _ in 0..self.config.periods {
                    self.scratch.as_bytes_mut()[..bytes].fill(0);
                    preroll(&mut self.scratch.as_bytes_mut()[..bytes], period);
                    self.queue_scratch()?;
                }
                if let AlStream::Playback { source, .. } = &mut self.stream {
                    source.play();
                }
            }
            StreamMode::Capture => match &mut self.stream {
                AlStream::CaptureMono(capture) => capture.start(),
                AlStream::CaptureStereo(capture) => capture.start(),
                AlStream::Playback { .. } => {}
            },
        }
        self.logger.log("device started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        match &mut self.stream {
            AlStream::Playback { source, queued, .. } => {
                source.stop();
                while source.unqueue_buffer().is_ok() {}
                *queued = 0;
            }
            AlStream::CaptureMono(capture) => capture.stop(),
            AlStream::CaptureStereo(capture) => capture.stop(),
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<usize, DeviceError> {
        let period = self.config.period_frames();
        let periods = self.config.periods;
        let buffer_frames = self.config.buffer_frames;
        let quantum = self.config.wait_quantum();
        loop {
            if self.interrupter.is_set() {
                return Ok(0);
            }
            let available = match &mut self.stream {
                AlStream::Playback { source, queued, .. } => {
                    let processed = source.buffers_processed() as usize;
                    (processed + periods.saturating_sub(*queued)) * period
                }
                AlStream::CaptureMono(capture) => capture.samples_len() as usize,
                AlStream::CaptureStereo(capture) => capture.samples_len() as usize,
            };
            if available >= period {
                return Ok(available.min(buffer_frames));
            }
            self.interrupter.sleep(quantum);
        }
    }

    fn transfer(
        &mut self,
        frames: usize,
        exchange: &mut FrameSource<'_>,
    ) -> Result<(), DeviceError> {
        let period = self.config.period_frames();
        let bytes_per_frame = self.config.spec.bytes_per_frame();

        match self.config.mode {
            StreamMode::Playback => {
                // Whole periods only; the queue has no smaller granularity.
                for _ in 0..(frames / period).max(1) {
                    let bytes = period * bytes_per_frame;
                    self.scratch.as_bytes_mut()[..bytes].fill(0);
                    exchange(&mut self.scratch.as_bytes_mut()[..bytes], period);
                    self.queue_scratch()?;
                }
            }
            StreamMode::Capture => {
                let mut remaining = frames;
                while remaining > 0 {
                    let take = remaining.min(period);
                    self.drain_capture(take)?;
                    exchange(&mut self.scratch.as_bytes_mut()[..take * bytes_per_frame], take);
                    remaining -= take;
                }
            }
        }
        Ok(())
    }
}
