//! The null backend: a silent endpoint paced off the monotonic clock.
//!
//! No audio hardware is touched. A virtual device consumes playback frames
//! (and produces capture silence) at exactly the configured sample rate,
//! which makes the backend ideal for CI, for benchmarking the DSP path, and
//! as the last-resort fallback when no native API initializes.

use std::time::Instant;

use crate::backend::{
    Backend, BackendKind, DeviceId, DeviceInfo, Endpoint, EndpointConfig, Interrupter, Logger,
    RingCursor,
};
use crate::config::{ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::resample::FrameSource;
use crate::format::AlignedScratch;

/// The null backend. Always initializes.
pub(crate) struct NullBackend;

impl NullBackend {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Backend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        let name = match mode {
            StreamMode::Playback => "Null Playback Device",
            StreamMode::Capture => "Null Capture Device",
        };
        Ok(vec![DeviceInfo {
            id: DeviceId::Null(0),
            name: name.to_string(),
            is_default: true,
        }])
    }

    fn open(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &ResolvedConfig,
        logger: Logger,
    ) -> Result<Box<dyn Endpoint>, DeviceError> {
        match device {
            None | Some(DeviceId::Null(0)) => {}
            Some(_) => return Err(DeviceError::NoDevice),
        }

        // The virtual device accepts any stream description as-is.
        let endpoint_config = EndpointConfig {
            mode,
            spec: config.spec.clone(),
            buffer_frames: config.buffer_frames,
            periods: config.periods,
        };
        logger.log(&format!(
            "opened {:?} endpoint: {} ch, {} Hz, {} frames x {} periods",
            mode,
            endpoint_config.spec.channels,
            endpoint_config.spec.sample_rate,
            endpoint_config.buffer_frames,
            endpoint_config.periods,
        ));

        Ok(Box::new(NullEndpoint::new(endpoint_config, logger)))
    }
}

/// A clock-paced endpoint with a real ring buffer and no device behind it.
pub(crate) struct NullEndpoint {
    config: EndpointConfig,
    interrupter: Interrupter,
    ring: RingCursor,
    buffer: AlignedScratch,
    started_at: Option<Instant>,
    /// Total frames exchanged since start (submitted for playback, delivered
    /// for capture).
    processed: u64,
    logger: Logger,
}

impl NullEndpoint {
    fn new(config: EndpointConfig, logger: Logger) -> Self {
        let bytes = config.buffer_frames * config.spec.bytes_per_frame();
        Self {
            ring: RingCursor::new(config.buffer_frames),
            buffer: AlignedScratch::new(bytes),
            interrupter: Interrupter::new(),
            started_at: None,
            processed: 0,
            config,
            logger,
        }
    }

    /// Frames the virtual hardware has consumed or produced so far.
    fn elapsed_frames(&self) -> u64 {
        match self.started_at {
            Some(at) => {
                (at.elapsed().as_secs_f64() * f64::from(self.config.spec.sample_rate)) as u64
            }
            None => 0,
        }
    }

    fn exchangeable_frames(&self) -> usize {
        let elapsed = self.elapsed_frames();
        let buffer = self.config.buffer_frames as u64;
        let raw = match self.config.mode {
            // Playback leads the hardware by a full buffer after pre-roll.
            StreamMode::Playback => (elapsed + buffer).saturating_sub(self.processed),
            StreamMode::Capture => elapsed.saturating_sub(self.processed),
        };
        raw.min(buffer) as usize
    }
}

impl Endpoint for NullEndpoint {
    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError> {
        if self.config.mode == StreamMode::Playback {
            let frames = self.config.buffer_frames;
            let filled = preroll(self.buffer.as_bytes_mut(), frames);
            debug_assert!(filled <= frames);
            self.processed = frames as u64;
        } else {
            self.processed = 0;
        }
        self.started_at = Some(Instant::now());
        self.logger.log("device started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.started_at = None;
        self.processed = 0;
        self.ring.reset();
        self.logger.log("device stopped");
        Ok(())
    }

    fn wait(&mut self) -> Result<usize, DeviceError> {
        let period = self.config.period_frames();
        let quantum = self.config.wait_quantum();
        loop {
            if self.interrupter.is_set() {
                return Ok(0);
            }
            let available = self.exchangeable_frames();
            if available >= period {
                return Ok(available);
            }
            self.interrupter.sleep(quantum);
        }
    }

    fn transfer(
        &mut self,
        frames: usize,
        exchange: &mut FrameSource<'_>,
    ) -> Result<(), DeviceError> {
        let bytes_per_frame = self.config.spec.bytes_per_frame();
        for (offset, len) in self.ring.spans(frames) {
            if len == 0 {
                continue;
            }
            let region = &mut self.buffer.as_bytes_mut()
                [offset * bytes_per_frame..(offset + len) * bytes_per_frame];
            if self.config.mode == StreamMode::Capture {
                // The virtual microphone records silence.
                region.fill(0);
            }
            exchange(region, len);
        }
        self.ring.advance(frames);
        self.processed += frames as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::pipeline::StreamSpec;
    use std::time::Duration;

    fn resolved(mode_rate: u32, buffer: usize, periods: usize) -> ResolvedConfig {
        ResolvedConfig {
            spec: StreamSpec::new(SampleFormat::S16, 2, mode_rate),
            buffer_frames: buffer,
            periods,
            buffer_defaulted: false,
            periods_defaulted: false,
        }
    }

    fn open(mode: StreamMode, config: &ResolvedConfig) -> Box<dyn Endpoint> {
        NullBackend::new()
            .open(
                mode,
                None,
                config,
                Logger::new(BackendKind::Null, None),
            )
            .unwrap()
    }

    #[test]
    fn test_enumeration_yields_one_default_device_per_mode() {
        let backend = NullBackend::new();
        for mode in [StreamMode::Playback, StreamMode::Capture] {
            let devices = backend.devices(mode).unwrap();
            assert_eq!(devices.len(), 1);
            assert!(devices[0].is_default);
            assert_eq!(devices[0].id, DeviceId::Null(0));
        }
    }

    #[test]
    fn test_unknown_id_rejected() {
        let backend = NullBackend::new();
        let err = backend
            .open(
                StreamMode::Playback,
                Some(&DeviceId::Null(3)),
                &resolved(48000, 480, 2),
                Logger::new(BackendKind::Null, None),
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::NoDevice));
    }

    #[test]
    fn test_negotiation_accepts_request_wholesale() {
        let config = resolved(44100, 4410, 2);
        let endpoint = open(StreamMode::Playback, &config);
        assert_eq!(endpoint.config().spec.sample_rate, 44100);
        assert_eq!(endpoint.config().buffer_frames, 4410);
        assert_eq!(endpoint.config().periods, 2);
    }

    #[test]
    fn test_playback_start_prerolls_full_buffer() {
        let config = resolved(48000, 480, 2);
        let mut endpoint = open(StreamMode::Playback, &config);

        let mut pulled = 0usize;
        let mut preroll = |out: &mut [u8], frames: usize| {
            pulled += frames;
            out.fill(0x42);
            frames
        };
        endpoint.start(&mut preroll).unwrap();
        assert_eq!(pulled, 480);
    }

    #[test]
    fn test_playback_wait_paces_by_period() {
        // 480 frames at 48 kHz = 10 ms buffer, 5 ms periods.
        let config = resolved(48000, 480, 2);
        let mut endpoint = open(StreamMode::Playback, &config);
        endpoint.start(&mut |_, frames| frames).unwrap();

        let started = Instant::now();
        let available = endpoint.wait().unwrap();
        let elapsed = started.elapsed();
        assert!(available >= 240, "got {available}");
        assert!(elapsed >= Duration::from_millis(3), "woke after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(100));
    }

    #[test]
    fn test_interrupt_breaks_wait_with_zero() {
        let config = resolved(48000, 48000, 2); // one second buffer
        let mut endpoint = open(StreamMode::Playback, &config);
        endpoint.start(&mut |_, frames| frames).unwrap();

        let interrupter = endpoint.interrupter();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            interrupter.interrupt();
        });
        let started = Instant::now();
        assert_eq!(endpoint.wait().unwrap(), 0);
        assert!(started.elapsed() < Duration::from_millis(500));
        waker.join().unwrap();
    }

    #[test]
    fn test_transfer_walks_the_ring() {
        let config = resolved(48000, 480, 2);
        let mut endpoint = open(StreamMode::Playback, &config);
        endpoint.start(&mut |_, frames| frames).unwrap();

        let mut seen = Vec::new();
        let mut exchange = |region: &mut [u8], frames: usize| {
            seen.push((region.len(), frames));
            frames
        };
        endpoint.transfer(300, &mut exchange).unwrap();
        endpoint.transfer(300, &mut exchange).unwrap();

        // Second transfer wraps: 180 to the end, 120 from the start.
        let bpf = 4;
        assert_eq!(seen, vec![(300 * bpf, 300), (180 * bpf, 180), (120 * bpf, 120)]);
    }

    #[test]
    fn test_capture_delivers_silence() {
        let config = resolved(48000, 480, 2);
        let mut endpoint = open(StreamMode::Capture, &config);
        endpoint.start(&mut |_, _| 0).unwrap();

        std::thread::sleep(Duration::from_millis(8));
        let available = endpoint.wait().unwrap();
        assert!(available >= 240);

        let mut all_zero = true;
        let mut delivered = 0;
        let mut exchange = |region: &mut [u8], frames: usize| {
            all_zero &= region.iter().all(|&b| b == 0);
            delivered += frames;
            frames
        };
        endpoint.transfer(available, &mut exchange).unwrap();
        assert!(all_zero);
        assert_eq!(delivered, available);
    }

    #[test]
    fn test_stop_rewinds_cursor() {
        let config = resolved(48000, 480, 2);
        let mut endpoint = open(StreamMode::Playback, &config);
        endpoint.start(&mut |_, frames| frames).unwrap();
        endpoint.transfer(100, &mut |_, frames| frames).unwrap();
        endpoint.stop().unwrap();

        // After a restart the first transfer begins at the ring start again.
        endpoint.start(&mut |_, frames| frames).unwrap();
        let mut offsets = Vec::new();
        let mut exchange = |region: &mut [u8], frames: usize| {
            offsets.push(region.len());
            frames
        };
        endpoint.transfer(240, &mut exchange).unwrap();
        assert_eq!(offsets, vec![240 * 4]);
    }
}
