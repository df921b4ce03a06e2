//! DirectSound backend (Windows).
//!
//! The oldest path in the crate: a looping secondary buffer whose play (or
//! read) cursor we chase with a [`RingCursor`]. DirectSound caps the useful
//! period count at four, and the region behind the hardware cursor is the
//! only thing we may touch, so the accounting is the plain modular arithmetic
//! the cursor type implements.

use std::ffi::c_void;

use windows::core::{GUID, PCWSTR};
use windows::Win32::Foundation::BOOL;
use windows::Win32::Media::Audio::DirectSound::{
    DirectSoundCaptureCreate8, DirectSoundCaptureEnumerateW, DirectSoundCreate8,
    DirectSoundEnumerateW, IDirectSound8, IDirectSoundBuffer, IDirectSoundCapture,
    IDirectSoundCaptureBuffer, DSBCAPS_GETCURRENTPOSITION2, DSBCAPS_GLOBALFOCUS, DSBPLAY_LOOPING,
    DSBUFFERDESC, DSCBSTART_LOOPING, DSCBUFFERDESC, DSSCL_PRIORITY,
};
use windows::Win32::Media::Audio::WAVEFORMATEX;
use windows::Win32::UI::WindowsAndMessaging::GetDesktopWindow;

use crate::backend::wasapi::extensible_from_spec;
use crate::backend::{
    Backend, BackendKind, DeviceId, DeviceInfo, Endpoint, EndpointConfig, Interrupter, Logger,
    RingCursor,
};
use crate::config::{ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::resample::FrameSource;
use crate::format::SampleFormat;
use crate::pipeline::StreamSpec;

/// DirectSound notification granularity makes more than four periods useless.
const MAX_PERIODS: usize = 4;

fn ds_err(context: &str, error: windows::core::Error) -> DeviceError {
    DeviceError::Backend {
        backend: BackendKind::DirectSound,
        message: format!("{context}: {error}"),
    }
}

fn guid_to_bytes(guid: &GUID) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&guid.data1.to_le_bytes());
    bytes[4..6].copy_from_slice(&guid.data2.to_le_bytes());
    bytes[6..8].copy_from_slice(&guid.data3.to_le_bytes());
    bytes[8..].copy_from_slice(&guid.data4);
    bytes
}

fn guid_from_bytes(bytes: &[u8; 16]) -> GUID {
    GUID {
        data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        data2: u16::from_le_bytes([bytes[4], bytes[5]]),
        data3: u16::from_le_bytes([bytes[6], bytes[7]]),
        data4: [
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ],
    }
}

struct EnumContext {
    devices: Vec<DeviceInfo>,
}

unsafe extern "system" fn enum_callback(
    guid: *mut GUID,
    description: PCWSTR,
    _module: PCWSTR,
    context: *mut c_void,
) -> BOOL {
    let context = &mut *(context as *mut EnumContext);
    let name = if description.is_null() {
        "Unknown".to_string()
    } else {
        description.to_string().unwrap_or_else(|_| "Unknown".to_string())
    };
    // The first entry carries a null GUID: the primary (default) driver.
    let (id, is_default) = if guid.is_null() {
        (DeviceId::DirectSound([0u8; 16]), true)
    } else {
        (DeviceId::DirectSound(guid_to_bytes(&*guid)), false)
    };
    context.devices.push(DeviceInfo { id, name, is_default });
    BOOL(1)
}

pub(crate) struct DsoundBackend;

impl DsoundBackend {
    pub(crate) fn new() -> Result<Self, DeviceError> {
        Ok(Self)
    }
}

impl Backend for DsoundBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectSound
    }

    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        let mut context = EnumContext {
            devices: Vec::new(),
        };
        let pointer = std::ptr::addr_of_mut!(context) as *mut c_void;
        unsafe {
            match mode {
                StreamMode::Playback => {
                    DirectSoundEnumerateW(Some(enum_callback), Some(pointer as *const c_void))
                        .map_err(|e| ds_err("enumerate", e))?;
                }
                StreamMode::Capture => {
                    DirectSoundCaptureEnumerateW(
                        Some(enum_callback),
                        Some(pointer as *const c_void),
                    )
                    .map_err(|e| ds_err("enumerate", e))?;
                }
            }
        }
        Ok(context.devices)
    }

    fn open(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &ResolvedConfig,
        logger: Logger,
    ) -> Result<Box<dyn Endpoint>, DeviceError> {
        let guid = match device {
            None | Some(DeviceId::DirectSound([0; 16])) => None,
            Some(DeviceId::DirectSound(bytes)) => Some(guid_from_bytes(bytes)),
            Some(_) => return Err(DeviceError::NoDevice),
        };

        // DirectSound converts formats internally; s24 is the one wire layout
        // its mixers reject often enough to avoid up front.
        let mut spec = config.spec.clone();
        if spec.format == SampleFormat::S24 {
            spec.format = SampleFormat::S32;
        }

        let buffer_frames = config.buffer_frames;
        let periods = config.periods.min(MAX_PERIODS);
        let endpoint_config = EndpointConfig {
            mode,
            spec: spec.clone(),
            buffer_frames,
            periods,
        };

        let wave = extensible_from_spec(&spec);
        let buffer_bytes = (buffer_frames * spec.bytes_per_frame()) as u32;

        let buffer = match mode {
            StreamMode::Playback => unsafe {
                let mut ds: Option<IDirectSound8> = None;
                DirectSoundCreate8(guid.as_ref().map(|g| g as *const GUID), &mut ds, None)
                    .map_err(|_| DeviceError::NoDevice)?;
                let ds = ds.ok_or(DeviceError::NoDevice)?;
                ds.SetCooperativeLevel(GetDesktopWindow(), DSSCL_PRIORITY)
                    .map_err(|e| ds_err("cooperative level", e))?;

                let desc = DSBUFFERDESC {
                    dwSize: std::mem::size_of::<DSBUFFERDESC>() as u32,
                    dwFlags: DSBCAPS_GLOBALFOCUS | DSBCAPS_GETCURRENTPOSITION2,
                    dwBufferBytes: buffer_bytes,
                    lpwfxFormat: &wave.Format as *const WAVEFORMATEX as *mut WAVEFORMATEX,
                    ..Default::default()
                };
                let mut secondary: Option<IDirectSoundBuffer> = None;
                ds.CreateSoundBuffer(&desc, &mut secondary, None)
                    .map_err(|e| DeviceError::BackendInit {
                        backend: BackendKind::DirectSound,
                        message: format!("sound buffer: {e}"),
                    })?;
                DsoundBuffer::Playback {
                    _device: ds,
                    buffer: secondary.ok_or(DeviceError::NoDevice)?,
                }
            },
            StreamMode::Capture => unsafe {
                let mut capture: Option<IDirectSoundCapture> = None;
                DirectSoundCaptureCreate8(guid.as_ref().map(|g| g as *const GUID), &mut capture, None)
                    .map_err(|_| DeviceError::NoDevice)?;
                let capture = capture.ok_or(DeviceError::NoDevice)?;

                let desc = DSCBUFFERDESC {
                    dwSize: std::mem::size_of::<DSCBUFFERDESC>() as u32,
                    dwBufferBytes: buffer_bytes,
                    lpwfxFormat: &wave.Format as *const WAVEFORMATEX as *mut WAVEFORMATEX,
                    ..Default::default()
                };
                let mut buffer: Option<IDirectSoundCaptureBuffer> = None;
                capture
                    .CreateCaptureBuffer(&desc, &mut buffer, None)
                    .map_err(|e| DeviceError::BackendInit {
                        backend: BackendKind::DirectSound,
                        message: format!("capture buffer: {e}"),
                    })?;
                DsoundBuffer::Capture {
                    _device: capture,
                    buffer: buffer.ok_or(DeviceError::NoDevice)?,
                }
            },
        };

        logger.log(&format!(
            "opened endpoint: {} {} ch {} Hz, {} frames x {} periods",
            endpoint_config.spec.format,
            endpoint_config.spec.channels,
            endpoint_config.spec.sample_rate,
            endpoint_config.buffer_frames,
            endpoint_config.periods,
        ));

        Ok(Box::new(DsoundEndpoint {
            ring: RingCursor::new(endpoint_config.buffer_frames),
            config: endpoint_config,
            buffer,
            interrupter: Interrupter::new(),
            logger,
        }))
    }
}

enum DsoundBuffer {
    Playback {
        _device: IDirectSound8,
        buffer: IDirectSoundBuffer,
    },
    Capture {
        _device: IDirectSoundCapture,
        buffer: IDirectSoundCaptureBuffer,
    },
}

pub(crate) struct DsoundEndpoint {
    config: EndpointConfig,
    buffer: DsoundBuffer,
    ring: RingCursor,
    interrupter: Interrupter,
    logger: Logger,
}

// COM pointers are confined to the worker thread after setup.
unsafe impl Send for DsoundEndpoint {}

impl DsoundEndpoint {
    /// Frame position of the hardware cursor that bounds our writes/reads.
    fn hardware_cursor(&self) -> Result<usize, DeviceError> {
        let bytes_per_frame = self.config.spec.bytes_per_frame();
        unsafe {
            match &self.buffer {
                DsoundBuffer::Playback { buffer, .. } => {
                    let mut play = 0u32;
                    buffer
                        .GetCurrentPosition(Some(&mut play), None)
                        .map_err(|e| ds_err("position", e))?;
                    Ok(play as usize / bytes_per_frame)
                }
                DsoundBuffer::Capture { buffer, .. } => {
                    let mut read = 0u32;
                    buffer
                        .GetCurrentPosition(None, Some(&mut read))
                        .map_err(|e| ds_err("position", e))?;
                    Ok(read as usize / bytes_per_frame)
                }
            }
        }
    }

    /// Locks one contiguous region, hands it to `exchange`, and unlocks on
    /// every path.
    fn exchange_span(
        &self,
        offset_frames: usize,
        frames: usize,
        exchange: &mut FrameSource<'_>,
    ) -> Result<(), DeviceError> {
        let bytes_per_frame = self.config.spec.bytes_per_frame();
        let offset = (offset_frames * bytes_per_frame) as u32;
        let bytes = (frames * bytes_per_frame) as u32;

        unsafe {
            let mut ptr1: *mut c_void = std::ptr::null_mut();
            let mut len1 = 0u32;
            let lock_result = match &self.buffer {
                DsoundBuffer::Playback { buffer, .. } => {
                    buffer.Lock(offset, bytes, &mut ptr1, &mut len1, None, None, 0)
                }
                DsoundBuffer::Capture { buffer, .. } => {
                    buffer.Lock(offset, bytes, &mut ptr1, &mut len1, None, None, 0)
                }
            };
            lock_result.map_err(|e| DeviceError::BufferMap {
                backend: BackendKind::DirectSound,
                message: e.to_string(),
            })?;

            let region = std::slice::from_raw_parts_mut(ptr1 as *mut u8, len1 as usize);
            exchange(region, len1 as usize / bytes_per_frame);

            let unlock_result = match &self.buffer {
                DsoundBuffer::Playback { buffer, .. } => buffer.Unlock(ptr1, len1, None, 0),
                DsoundBuffer::Capture { buffer, .. } => buffer.Unlock(ptr1, len1, None, 0),
            };
            unlock_result.map_err(|e| ds_err("unlock", e))
        }
    }
}

impl Endpoint for DsoundEndpoint {
    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError> {
        match &self.buffer {
            DsoundBuffer::Playback { .. } => {
                self.exchange_span(0, self.config.buffer_frames, preroll)?;
                let DsoundBuffer::Playback { buffer, .. } = &self.buffer else {
                    unreachable!();
                };
                unsafe {
                    buffer
                        .Play(0, 0, DSBPLAY_LOOPING)
                        .map_err(|e| DeviceError::BackendStart {
                            backend: BackendKind::DirectSound,
                            message: e.to_string(),
                        })?;
                }
            }
            DsoundBuffer::Capture { buffer, .. } => unsafe {
                buffer
                    .Start(DSCBSTART_LOOPING)
                    .map_err(|e| DeviceError::BackendStart {
                        backend: BackendKind::DirectSound,
                        message: e.to_string(),
                    })?;
            },
        }
        self.logger.log("device started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        unsafe {
            match &self.buffer {
                DsoundBuffer::Playback { buffer, .. } => {
                    buffer.Stop().map_err(|e| DeviceError::BackendStop {
                        backend: BackendKind::DirectSound,
                        message: e.to_string(),
                    })?;
                    buffer
                        .SetCurrentPosition(0)
                        .map_err(|e| ds_err("rewind", e))?;
                }
                DsoundBuffer::Capture { buffer, .. } => {
                    buffer.Stop().map_err(|e| DeviceError::BackendStop {
                        backend: BackendKind::DirectSound,
                        message: e.to_string(),
                    })?;
                }
            }
        }
        self.ring.reset();
        Ok(())
    }

    fn wait(&mut self) -> Result<usize, DeviceError> {
        let period = self.config.period_frames();
        let quantum = self.config.wait_quantum();
        loop {
            if self.interrupter.is_set() {
                return Ok(0);
            }
            // Both directions chase the hardware cursor: the span it has
            // passed is ours to refill (playback) or to read out (capture).
            let hardware = self.hardware_cursor()?;
            let available = self.ring.available_to_read(hardware);
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
        for (offset, len) in self.ring.spans(frames) {
            if len == 0 {
                continue;
            }
            self.exchange_span(offset, len, exchange)?;
        }
        self.ring.advance(frames);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_bytes_round_trip() {
        let guid = GUID {
            data1: 0x1234_5678,
            data2: 0x9ABC,
            data3: 0xDEF0,
            data4: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = guid_to_bytes(&guid);
        let back = guid_from_bytes(&bytes);
        assert_eq!(back.data1, guid.data1);
        assert_eq!(back.data2, guid.data2);
        assert_eq!(back.data3, guid.data3);
        assert_eq!(back.data4, guid.data4);
    }

    #[test]
    fn test_period_cap() {
        assert_eq!(MAX_PERIODS, 4);
    }
}
