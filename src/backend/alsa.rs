//! ALSA backend (Linux).
//!
//! Endpoints are plain `snd_pcm` handles in interleaved read/write mode. ALSA
//! owns the ring buffer; this side only tracks how many frames it may move
//! per period and stages them through an aligned scratch so the typed
//! `writei`/`readi` calls can cast safely.
//!
//! Auto-start is disabled (the start threshold is parked beyond the buffer)
//! so the pre-roll contract holds: playback fills the whole buffer first,
//! then the stream starts explicitly. An underrun or overrun is repaired once
//! per episode with `prepare`; a second consecutive failure propagates.

use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::{Direction, ValueOr};

use crate::backend::{
    Backend, BackendKind, DeviceId, DeviceInfo, Endpoint, EndpointConfig, Interrupter, Logger,
};
use crate::config::{ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::channel::default_channel_map;
use crate::format::resample::FrameSource;
use crate::format::{AlignedScratch, SampleFormat};
use crate::pipeline::StreamSpec;

/// Formats tried during negotiation, best match first. s24 is excluded: the
/// packed 3-byte layout has no typed I/O path, so s24 clients are bridged to
/// s32 by the pipeline instead.
const FORMAT_PREFERENCE: [SampleFormat; 4] = [
    SampleFormat::F32,
    SampleFormat::S32,
    SampleFormat::S16,
    SampleFormat::U8,
];

pub(crate) struct AlsaBackend;

impl AlsaBackend {
    pub(crate) fn new() -> Result<Self, DeviceError> {
        Ok(Self)
    }
}

impl Backend for AlsaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Alsa
    }

    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        let wanted = direction(mode);
        let hints = HintIter::new_str(None, "pcm").map_err(|e| DeviceError::BackendInit {
            backend: BackendKind::Alsa,
            message: e.to_string(),
        })?;

        let mut devices = Vec::new();
        for hint in hints {
            let Some(name) = hint.name else { continue };
            // A missing direction means the PCM serves both.
            if hint.direction.is_some_and(|d| d != wanted) {
                continue;
            }
            let friendly = hint
                .desc
                .as_deref()
                .and_then(|d| d.lines().next())
                .unwrap_or(&name)
                .to_string();
            let is_default = name == "default";
            devices.push(DeviceInfo {
                id: DeviceId::Alsa(name),
                name: friendly,
                is_default,
            });
        }
        Ok(devices)
    }

    fn open(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &ResolvedConfig,
        logger: Logger,
    ) -> Result<Box<dyn Endpoint>, DeviceError> {
        let name = match device {
            None => "default",
            Some(DeviceId::Alsa(name)) => name.as_str(),
            Some(_) => return Err(DeviceError::NoDevice),
        };

        let pcm = PCM::new(name, direction(mode), false).map_err(|e| {
            if device.is_some() {
                DeviceError::NoDevice
            } else {
                DeviceError::BackendInit {
                    backend: BackendKind::Alsa,
                    message: format!("open {name}: {e}"),
                }
            }
        })?;

        let endpoint_config = negotiate(&pcm, mode, config)?;

        logger.log(&format!(
            "opened {name}: {} {} ch {} Hz, {} frames x {} periods",
            endpoint_config.spec.format,
            endpoint_config.spec.channels,
            endpoint_config.spec.sample_rate,
            endpoint_config.buffer_frames,
            endpoint_config.periods,
        ));

        let scratch = AlignedScratch::new(
            endpoint_config.buffer_frames * endpoint_config.spec.bytes_per_frame(),
        );
        Ok(Box::new(AlsaEndpoint {
            config: endpoint_config,
            pcm,
            interrupter: Interrupter::new(),
            scratch,
            logger,
        }))
    }
}

fn direction(mode: StreamMode) -> Direction {
    match mode {
        StreamMode::Playback => Direction::Playback,
        StreamMode::Capture => Direction::Capture,
    }
}

fn native_format(format: SampleFormat) -> Format {
    match format {
        SampleFormat::U8 => Format::U8,
        SampleFormat::S16 => Format::S16LE,
        SampleFormat::S32 => Format::S32LE,
        SampleFormat::F32 => Format::FloatLE,
        // Never negotiated; see FORMAT_PREFERENCE.
        SampleFormat::S24 => Format::S243LE,
    }
}

/// Configures hw/sw params and reports what the device actually accepted.
fn negotiate(
    pcm: &PCM,
    mode: StreamMode,
    config: &ResolvedConfig,
) -> Result<EndpointConfig, DeviceError> {
    let al = |e: alsa::Error| DeviceError::BackendInit {
        backend: BackendKind::Alsa,
        message: e.to_string(),
    };
    let requested = &config.spec;

    let hwp = HwParams::any(pcm).map_err(al)?;
    hwp.set_access(Access::RWInterleaved).map_err(al)?;

    let mut format = None;
    let mut candidates = vec![requested.format];
    candidates.extend(FORMAT_PREFERENCE);
    for candidate in candidates {
        if candidate == SampleFormat::S24 {
            continue;
        }
        if hwp.set_format(native_format(candidate)).is_ok() {
            format = Some(candidate);
            break;
        }
    }
    let format = format.ok_or(DeviceError::FormatNotSupported)?;

    let channels = {
        let mut chosen = None;
        for candidate in [requested.channels as u32, 2, 1] {
            if hwp.set_channels(candidate).is_ok() {
                chosen = Some(candidate);
                break;
            }
        }
        match chosen {
            Some(c) => c,
            None => {
                let max = hwp.get_channels_max().map_err(al)?;
                hwp.set_channels(max).map_err(al)?;
                max
            }
        }
    };

    let rate = hwp
        .set_rate_near(requested.sample_rate, ValueOr::Nearest)
        .map_err(al)?;
    let buffer_frames = hwp
        .set_buffer_size_near(config.buffer_frames as Frames)
        .map_err(al)?;
    let period_frames = hwp
        .set_period_size_near(
            (buffer_frames / config.periods as Frames).max(1),
            ValueOr::Nearest,
        )
        .map_err(al)?;
    pcm.hw_params(&hwp).map_err(al)?;

    let swp = pcm.sw_params_current().map_err(al)?;
    swp.set_avail_min(period_frames).map_err(al)?;
    // Park the threshold beyond the buffer: starting is always explicit.
    swp.set_start_threshold(buffer_frames * 2).map_err(al)?;
    pcm.sw_params(&swp).map_err(al)?;

    let buffer_frames = buffer_frames as usize;
    let periods = (buffer_frames / (period_frames as usize).max(1)).max(1);
    Ok(EndpointConfig {
        mode,
        spec: StreamSpec {
            format,
            channels: channels as usize,
            sample_rate: rate,
            channel_map: default_channel_map(channels as u16),
        },
        buffer_frames,
        periods,
    })
}

pub(crate) struct AlsaEndpoint {
    config: EndpointConfig,
    pcm: PCM,
    interrupter: Interrupter,
    scratch: AlignedScratch,
    logger: Logger,
}

impl AlsaEndpoint {
    fn backend_error(&self, message: String) -> DeviceError {
        DeviceError::Backend {
            backend: BackendKind::Alsa,
            message,
        }
    }

    /// One-shot xrun repair: re-prepare, and restart a capture stream (a
    /// playback stream restarts once the next period has been written).
    fn recover(&self, cause: &str) -> Result<(), DeviceError> {
        self.logger.log(&format!("recovering from {cause}"));
        self.pcm
            .prepare()
            .map_err(|e| self.backend_error(format!("recover: {e}")))?;
        if self.config.mode == StreamMode::Capture {
            self.pcm
                .start()
                .map_err(|e| self.backend_error(format!("restart: {e}")))?;
        }
        Ok(())
    }

    /// Restarts playback after an xrun once fresh data has been queued.
    fn restart_if_prepared(&self) -> Result<(), DeviceError> {
        if self.config.mode == StreamMode::Playback && self.pcm.state() == State::Prepared {
            self.pcm
                .start()
                .map_err(|e| self.backend_error(format!("restart: {e}")))?;
        }
        Ok(())
    }

    fn write_frames(&self, frames: usize) -> Result<(), DeviceError> {
        let spec = &self.config.spec;
        let bytes = &self.scratch.as_bytes()[..frames * spec.bytes_per_frame()];
        let mut written = 0usize;
        let mut recovered = false;

        while written < frames {
            let remaining = &bytes[written * spec.bytes_per_frame()..];
            let result = match spec.format {
                SampleFormat::U8 => self.pcm.io_u8().and_then(|io| io.writei(remaining)),
                SampleFormat::S16 => self
                    .pcm
                    .io_i16()
                    .and_then(|io| io.writei(bytemuck::cast_slice(remaining))),
                SampleFormat::S32 => self
                    .pcm
                    .io_i32()
                    .and_then(|io| io.writei(bytemuck::cast_slice(remaining))),
                SampleFormat::F32 => self
                    .pcm
                    .io_f32()
                    .and_then(|io| io.writei(bytemuck::cast_slice(remaining))),
                SampleFormat::S24 => {
                    return Err(self.backend_error("s24 is never negotiated".to_string()))
                }
            };
            match result {
                Ok(n) => written += n,
                Err(e) if !recovered => {
                    recovered = true;
                    self.pcm
                        .try_recover(e, true)
                        .map_err(|e| self.backend_error(format!("write recover: {e}")))?;
                }
                Err(e) => return Err(self.backend_error(format!("write: {e}"))),
            }
        }
        Ok(())
    }

    fn read_frames(&mut self, frames: usize) -> Result<(), DeviceError> {
        let bytes_per_frame = self.config.spec.bytes_per_frame();
        let format = self.config.spec.format;
        let mut read = 0usize;
        let mut recovered = false;

        while read < frames {
            let remaining =
                &mut self.scratch.as_bytes_mut()[read * bytes_per_frame..frames * bytes_per_frame];
            let result = match format {
                SampleFormat::U8 => self.pcm.io_u8().and_then(|io| io.readi(remaining)),
                SampleFormat::S16 => self
                    .pcm
                    .io_i16()
                    .and_then(|io| io.readi(bytemuck::cast_slice_mut(remaining))),
                SampleFormat::S32 => self
                    .pcm
                    .io_i32()
                    .and_then(|io| io.readi(bytemuck::cast_slice_mut(remaining))),
                SampleFormat::F32 => self
                    .pcm
                    .io_f32()
                    .and_then(|io| io.readi(bytemuck::cast_slice_mut(remaining))),
                SampleFormat::S24 => {
                    return Err(self.backend_error("s24 is never negotiated".to_string()))
                }
            };
            match result {
                Ok(n) => read += n,
                Err(e) if !recovered => {
                    recovered = true;
                    self.pcm
                        .try_recover(e, true)
                        .map_err(|e| self.backend_error(format!("read recover: {e}")))?;
                    self.pcm
                        .start()
                        .map_err(|e| self.backend_error(format!("restart: {e}")))?;
                }
                Err(e) => return Err(self.backend_error(format!("read: {e}"))),
            }
        }
        Ok(())
    }
}

impl Endpoint for AlsaEndpoint {
    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError> {
        if self.pcm.state() != State::Prepared {
            self.pcm.prepare().map_err(|e| DeviceError::BackendStart {
                backend: BackendKind::Alsa,
                message: format!("prepare: {e}"),
            })?;
        }

        if self.config.mode == StreamMode::Playback {
            let frames = self.config.buffer_frames;
            let bytes = frames * self.config.spec.bytes_per_frame();
            let filled = preroll(&mut self.scratch.as_bytes_mut()[..bytes], frames);
            debug_assert!(filled <= frames);
            self.write_frames(frames)
                .map_err(|e| DeviceError::BackendStart {
                    backend: BackendKind::Alsa,
                    message: format!("pre-roll: {e}"),
                })?;
        }

        self.pcm.start().map_err(|e| DeviceError::BackendStart {
            backend: BackendKind::Alsa,
            message: e.to_string(),
        })
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.pcm.drop().map_err(|e| DeviceError::BackendStop {
            backend: BackendKind::Alsa,
            message: e.to_string(),
        })?;
        // Leave the stream prepared so the next start finds a clean cursor.
        self.pcm.prepare().map_err(|e| DeviceError::BackendStop {
            backend: BackendKind::Alsa,
            message: format!("prepare: {e}"),
        })
    }

    fn wait(&mut self) -> Result<usize, DeviceError> {
        let period = self.config.period_frames();
        let quantum = self.config.wait_quantum();
        let mut recovered = false;

        loop {
            if self.interrupter.is_set() {
                return Ok(0);
            }

            match self.pcm.state() {
                State::XRun => {
                    if recovered {
                        return Err(self.backend_error("repeated xrun".to_string()));
                    }
                    recovered = true;
                    self.recover("xrun")?;
                    continue;
                }
                State::Suspended => {
                    self.recover("suspend")?;
                    continue;
                }
                _ => {}
            }

            match self.pcm.avail_update() {
                Ok(avail) if avail as usize >= period => {
                    return Ok((avail as usize).min(self.config.buffer_frames));
                }
                Ok(_) => self.interrupter.sleep(quantum),
                Err(e) => {
                    if recovered {
                        return Err(self.backend_error(format!("avail: {e}")));
                    }
                    recovered = true;
                    self.pcm
                        .try_recover(e, true)
                        .map_err(|e| self.backend_error(format!("avail recover: {e}")))?;
                }
            }
        }
    }

    fn transfer(
        &mut self,
        frames: usize,
        exchange: &mut FrameSource<'_>,
    ) -> Result<(), DeviceError> {
        let bytes = frames * self.config.spec.bytes_per_frame();
        match self.config.mode {
            StreamMode::Playback => {
                exchange(&mut self.scratch.as_bytes_mut()[..bytes], frames);
                self.write_frames(frames)?;
                self.restart_if_prepared()?;
            }
            StreamMode::Capture => {
                self.read_frames(frames)?;
                exchange(&mut self.scratch.as_bytes_mut()[..bytes], frames);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_preference_excludes_s24() {
        assert!(!FORMAT_PREFERENCE.contains(&SampleFormat::S24));
    }

    #[test]
    fn test_direction_mapping() {
        assert_eq!(direction(StreamMode::Playback), Direction::Playback);
        assert_eq!(direction(StreamMode::Capture), Direction::Capture);
    }

    // Anything touching a real PCM needs hardware (or at least a functional
    // null plugin) and is exercised manually.
    #[test]
    #[ignore = "requires a working ALSA setup"]
    fn test_open_default_playback() {
        let backend = AlsaBackend::new().unwrap();
        let config = crate::config::DeviceConfig::default().resolve().unwrap();
        let endpoint = backend
            .open(
                StreamMode::Playback,
                None,
                &config,
                Logger::new(BackendKind::Alsa, None),
            )
            .unwrap();
        assert!(endpoint.config().buffer_frames >= endpoint.config().periods);
    }

    #[test]
    #[ignore = "requires a working ALSA setup"]
    fn test_enumerate_lists_default() {
        let backend = AlsaBackend::new().unwrap();
        let devices = backend.devices(StreamMode::Playback).unwrap();
        assert!(devices.iter().any(|d| d.is_default));
    }
}
