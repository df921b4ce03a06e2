//! WASAPI backend (Windows, shared mode).
//!
//! Endpoints are event-driven shared-mode `IAudioClient` streams. The OS
//! mixer dictates most of the stream description; negotiation asks for the
//! requested layout, takes the closest match the engine offers, and falls
//! back to the mix format. Devices are identified by their endpoint path as
//! the OS reports it, in wide characters.

use std::ffi::c_void;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, EDataFlow, IAudioCaptureClient, IAudioClient,
    IAudioRenderClient, IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator,
    AUDCLNT_SHAREMODE_SHARED, AUDCLNT_STREAMFLAGS_EVENTCALLBACK, DEVICE_STATE_ACTIVE,
    WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::Media::KernelStreaming::{KSDATAFORMAT_SUBTYPE_PCM, WAVE_FORMAT_EXTENSIBLE};
use windows::Win32::Media::Multimedia::{KSDATAFORMAT_SUBTYPE_IEEE_FLOAT, WAVE_FORMAT_IEEE_FLOAT};
use windows::Win32::System::Com::StructuredStorage::PROPVARIANT;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};
use windows::Win32::UI::Shell::PropertiesSystem::PropVariantToStringAlloc;

use crate::backend::{
    Backend, BackendKind, DeviceId, DeviceInfo, Endpoint, EndpointConfig, Interrupter, Logger,
};
use crate::config::{ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::channel::{default_channel_map, Channel, MAX_CHANNELS};
use crate::format::resample::FrameSource;
use crate::format::SampleFormat;
use crate::pipeline::StreamSpec;

/// PKEY_Device_FriendlyName lives in functiondiscovery; re-imported here to
/// keep the cfg surface in one place.
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;

thread_local! {
    static COM_READY: bool = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED).is_ok() };
}

/// COM must be initialized once per thread that touches MMDevice objects.
fn ensure_com() {
    COM_READY.with(|_| {});
}

fn win_err(kind: BackendKind, context: &str, error: windows::core::Error) -> DeviceError {
    DeviceError::Backend {
        backend: kind,
        message: format!("{context}: {error}"),
    }
}

pub(crate) struct WasapiBackend;

impl WasapiBackend {
    pub(crate) fn new() -> Result<Self, DeviceError> {
        ensure_com();
        // Probe the enumerator so an unusable audio service fails over to the
        // next backend at context init rather than at first use.
        enumerator()?;
        Ok(Self)
    }
}

fn enumerator() -> Result<IMMDeviceEnumerator, DeviceError> {
    ensure_com();
    unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }.map_err(|e| {
        DeviceError::BackendInit {
            backend: BackendKind::Wasapi,
            message: e.to_string(),
        }
    })
}

fn data_flow(mode: StreamMode) -> EDataFlow {
    match mode {
        StreamMode::Playback => eRender,
        StreamMode::Capture => eCapture,
    }
}

/// Copies an endpoint id string and frees the COM allocation.
unsafe fn take_wide_string(ptr: windows::core::PWSTR) -> Vec<u16> {
    let mut wide = Vec::new();
    let mut cursor = ptr.0;
    while *cursor != 0 {
        wide.push(*cursor);
        cursor = cursor.add(1);
    }
    CoTaskMemFree(Some(ptr.0 as *const c_void));
    wide
}

fn friendly_name(device: &IMMDevice) -> String {
    unsafe {
        let Ok(store) = device.OpenPropertyStore(STGM_READ) else {
            return "Unknown".to_string();
        };
        let Ok(value) = store.GetValue(&PKEY_Device_FriendlyName) else {
            return "Unknown".to_string();
        };
        let value: PROPVARIANT = value;
        match PropVariantToStringAlloc(&value) {
            Ok(name) => String::from_utf16_lossy(&take_wide_string(name)),
            Err(_) => "Unknown".to_string(),
        }
    }
}

impl Backend for WasapiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasapi
    }

    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        let enumerator = enumerator()?;
        let kind = BackendKind::Wasapi;
        unsafe {
            let default_id = enumerator
                .GetDefaultAudioEndpoint(data_flow(mode), eConsole)
                .ok()
                .and_then(|d| d.GetId().ok().map(|id| take_wide_string(id)));

            let collection = enumerator
                .EnumAudioEndpoints(data_flow(mode), DEVICE_STATE_ACTIVE)
                .map_err(|e| win_err(kind, "enumerate", e))?;
            let count = collection.GetCount().map_err(|e| win_err(kind, "count", e))?;

            let mut devices = Vec::with_capacity(count as usize);
            for index in 0..count {
                let device = collection.Item(index).map_err(|e| win_err(kind, "item", e))?;
                let id = take_wide_string(device.GetId().map_err(|e| win_err(kind, "id", e))?);
                let is_default = default_id.as_deref() == Some(id.as_slice());
                devices.push(DeviceInfo {
                    name: friendly_name(&device),
                    id: DeviceId::Wasapi(id),
                    is_default,
                });
            }
            Ok(devices)
        }
    }

    fn open(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &ResolvedConfig,
        logger: Logger,
    ) -> Result<Box<dyn Endpoint>, DeviceError> {
        let kind = BackendKind::Wasapi;
        let enumerator = enumerator()?;

        let mm_device = unsafe {
            match device {
                None => enumerator
                    .GetDefaultAudioEndpoint(data_flow(mode), eConsole)
                    .map_err(|_| DeviceError::NoDevice)?,
                Some(DeviceId::Wasapi(path)) => {
                    let mut wide = path.clone();
                    wide.push(0);
                    enumerator
                        .GetDevice(PCWSTR(wide.as_ptr()))
                        .map_err(|_| DeviceError::NoDevice)?
                }
                Some(_) => return Err(DeviceError::NoDevice),
            }
        };

        let client: IAudioClient = unsafe {
            mm_device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| win_err(kind, "activate", e))?
        };

        let (format, wave) = negotiate_format(&client, &config.spec)?;

        let buffer_duration_hns =
            config.buffer_frames as i64 * 10_000_000 / i64::from(format.sample_rate);
        unsafe {
            client
                .Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
                    buffer_duration_hns,
                    0,
                    &wave.Format,
                    None,
                )
                .map_err(|e| win_err(kind, "initialize", e))?;
        }

        let event = unsafe {
            CreateEventW(None, false, false, None).map_err(|_| DeviceError::EventCreation)?
        };
        unsafe {
            client
                .SetEventHandle(event)
                .map_err(|e| win_err(kind, "event handle", e))?;
        }

        let buffer_frames = unsafe {
            client
                .GetBufferSize()
                .map_err(|e| win_err(kind, "buffer size", e))?
        } as usize;

        let endpoint_config = EndpointConfig {
            mode,
            spec: format,
            buffer_frames,
            periods: config.periods.min(buffer_frames).max(1),
        };
        logger.log(&format!(
            "opened endpoint: {} {} ch {} Hz, {} frames x {} periods",
            endpoint_config.spec.format,
            endpoint_config.spec.channels,
            endpoint_config.spec.sample_rate,
            endpoint_config.buffer_frames,
            endpoint_config.periods,
        ));

        let service = unsafe {
            match mode {
                StreamMode::Playback => ClientService::Render(
                    client
                        .GetService::<IAudioRenderClient>()
                        .map_err(|e| win_err(kind, "render service", e))?,
                ),
                StreamMode::Capture => ClientService::Capture(
                    client
                        .GetService::<IAudioCaptureClient>()
                        .map_err(|e| win_err(kind, "capture service", e))?,
                ),
            }
        };

        Ok(Box::new(WasapiEndpoint {
            config: endpoint_config,
            client,
            service,
            event: EventHandle(event),
            interrupter: Interrupter::new(),
            logger,
        }))
    }
}

/// Picks the stream description the shared-mode engine will accept.
fn negotiate_format(
    client: &IAudioClient,
    requested: &StreamSpec,
) -> Result<(StreamSpec, WAVEFORMATEXTENSIBLE), DeviceError> {
    let kind = BackendKind::Wasapi;
    let wanted = extensible_from_spec(requested);

    unsafe {
        let mut closest: *mut WAVEFORMATEX = std::ptr::null_mut();
        let hr = client.IsFormatSupported(
            AUDCLNT_SHAREMODE_SHARED,
            &wanted.Format,
            Some(&mut closest),
        );

        if hr.is_ok() && closest.is_null() {
            return Ok((requested.clone(), wanted));
        }

        let source = if !closest.is_null() {
            closest
        } else {
            client
                .GetMixFormat()
                .map_err(|e| win_err(kind, "mix format", e))?
        };
        let (spec, wave) = spec_from_wave(source)?;
        CoTaskMemFree(Some(source as *const c_void));
        Ok((spec, wave))
    }
}

pub(crate) fn extensible_from_spec(spec: &StreamSpec) -> WAVEFORMATEXTENSIBLE {
    let bits = (spec.format.bytes_per_sample() * 8) as u16;
    let is_float = spec.format == SampleFormat::F32;
    let block_align = spec.bytes_per_frame() as u16;

    let mut wave = WAVEFORMATEXTENSIBLE::default();
    wave.Format.wFormatTag = WAVE_FORMAT_EXTENSIBLE as u16;
    wave.Format.nChannels = spec.channels as u16;
    wave.Format.nSamplesPerSec = spec.sample_rate;
    wave.Format.wBitsPerSample = bits;
    wave.Format.nBlockAlign = block_align;
    wave.Format.nAvgBytesPerSec = spec.sample_rate * u32::from(block_align);
    wave.Format.cbSize = (std::mem::size_of::<WAVEFORMATEXTENSIBLE>()
        - std::mem::size_of::<WAVEFORMATEX>()) as u16;
    wave.Samples.wValidBitsPerSample = bits;
    wave.dwChannelMask = mask_from_map(&spec.channel_map);
    wave.SubFormat = if is_float {
        KSDATAFORMAT_SUBTYPE_IEEE_FLOAT
    } else {
        KSDATAFORMAT_SUBTYPE_PCM
    };
    wave
}

/// Speaker-mask bits are numbered exactly one below our channel ids.
fn mask_from_map(map: &[Channel]) -> u32 {
    map.iter()
        .filter(|c| **c != Channel::None)
        .fold(0u32, |mask, c| mask | 1 << (c.id() - 1))
}

fn map_from_mask(mask: u32, channels: usize) -> Vec<Channel> {
    let mut map = Vec::with_capacity(channels);
    for bit in 0..MAX_CHANNELS {
        if map.len() == channels {
            break;
        }
        if mask & (1 << bit) != 0 {
            // Bit n is channel id n + 1.
            map.push(match bit as u8 + 1 {
                1 => Channel::FrontLeft,
                2 => Channel::FrontRight,
                3 => Channel::FrontCenter,
                4 => Channel::Lfe,
                5 => Channel::BackLeft,
                6 => Channel::BackRight,
                7 => Channel::FrontLeftCenter,
                8 => Channel::FrontRightCenter,
                9 => Channel::BackCenter,
                10 => Channel::SideLeft,
                11 => Channel::SideRight,
                12 => Channel::TopCenter,
                13 => Channel::TopFrontLeft,
                14 => Channel::TopFrontCenter,
                15 => Channel::TopFrontRight,
                16 => Channel::TopBackLeft,
                17 => Channel::TopBackCenter,
                _ => Channel::TopBackRight,
            });
        }
    }
    if map.len() != channels {
        return default_channel_map(channels as u16);
    }
    map
}

/// Reads a (possibly extensible) wave format into our stream description.
unsafe fn spec_from_wave(
    wave: *const WAVEFORMATEX,
) -> Result<(StreamSpec, WAVEFORMATEXTENSIBLE), DeviceError> {
    let base = *wave;
    let channels = usize::from(base.nChannels);
    let rate = base.nSamplesPerSec;

    let (is_float, valid_bits, mask) = if u32::from(base.wFormatTag) == WAVE_FORMAT_EXTENSIBLE {
        let ext = *(wave as *const WAVEFORMATEXTENSIBLE);
        (
            ext.SubFormat == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT,
            ext.Samples.wValidBitsPerSample,
            ext.dwChannelMask,
        )
    } else {
        (
            u32::from(base.wFormatTag) == WAVE_FORMAT_IEEE_FLOAT,
            base.wBitsPerSample,
            0,
        )
    };

    let format = match (is_float, base.wBitsPerSample, valid_bits) {
        (true, 32, _) => SampleFormat::F32,
        (false, 8, _) => SampleFormat::U8,
        (false, 16, _) => SampleFormat::S16,
        (false, 24, _) => SampleFormat::S24,
        (false, 32, 24) | (false, 32, 32) => SampleFormat::S32,
        _ => return Err(DeviceError::FormatNotSupported),
    };

    let channel_map = if mask != 0 {
        map_from_mask(mask, channels)
    } else {
        default_channel_map(channels as u16)
    };

    let spec = StreamSpec {
        format,
        channels,
        sample_rate: rate,
        channel_map,
    };
    // Rebuild a canonical extensible struct so Initialize always sees a
    // fully specified layout.
    let wave = extensible_from_spec(&spec);
    Ok((spec, wave))
}

/// Owns the stream event handle; closed on drop.
struct EventHandle(HANDLE);

impl Drop for EventHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

enum ClientService {
    Render(IAudioRenderClient),
    Capture(IAudioCaptureClient),
}

pub(crate) struct WasapiEndpoint {
    config: EndpointConfig,
    client: IAudioClient,
    service: ClientService,
    event: EventHandle,
    interrupter: Interrupter,
    logger: Logger,
}

// The COM interfaces are used from the worker thread only after setup; the
// event handle is a kernel object and freely shareable.
unsafe impl Send for WasapiEndpoint {}

impl WasapiEndpoint {
    fn playback_space(&self) -> Result<usize, DeviceError> {
        let padding = unsafe {
            self.client
                .GetCurrentPadding()
                .map_err(|e| win_err(BackendKind::Wasapi, "padding", e))?
        } as usize;
        Ok(self.config.buffer_frames.saturating_sub(padding))
    }

    fn capture_ready(&self) -> Result<usize, DeviceError> {
        let ClientService::Capture(capture) = &self.service else {
            return Ok(0);
        };
        let packet = unsafe {
            capture
                .GetNextPacketSize()
                .map_err(|e| win_err(BackendKind::Wasapi, "packet size", e))?
        };
        Ok(packet as usize)
    }
}

impl Endpoint for WasapiEndpoint {
    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError> {
        ensure_com();
        let kind = BackendKind::Wasapi;

        if self.config.mode == StreamMode::Playback {
            let frames = self.config.buffer_frames;
            let bytes_per_frame = self.config.spec.bytes_per_frame();
            let ClientService::Render(render) = &self.service else {
                unreachable!("playback endpoint always has a render service");
            };
            unsafe {
                let data = render
                    .GetBuffer(frames as u32)
                    .map_err(|e| DeviceError::BufferMap {
                        backend: kind,
                        message: e.to_string(),
                    })?;
                let region = std::slice::from_raw_parts_mut(data, frames * bytes_per_frame);
                region.fill(0);
                preroll(region, frames);
                render
                    .ReleaseBuffer(frames as u32, 0)
                    .map_err(|e| win_err(kind, "release", e))?;
            }
        }

        unsafe {
            self.client.Start().map_err(|e| DeviceError::BackendStart {
                backend: kind,
                message: e.to_string(),
            })
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let kind = BackendKind::Wasapi;
        unsafe {
            self.client.Stop().map_err(|e| DeviceError::BackendStop {
                backend: kind,
                message: e.to_string(),
            })?;
            self.client.Reset().map_err(|e| DeviceError::BackendStop {
                backend: kind,
                message: format!("reset: {e}"),
            })?;
            // A stale event would make the next run's first wait spurious.
            let _ = SetEvent(self.event.0);
        }
        self.logger.log("device stopped");
        Ok(())
    }

    fn wait(&mut self) -> Result<usize, DeviceError> {
        let period = self.config.period_frames();
        let quantum_ms = self.config.wait_quantum().as_millis() as u32;

        loop {
            if self.interrupter.is_set() {
                return Ok(0);
            }
            let ready = match self.config.mode {
                StreamMode::Playback => self.playback_space()?,
                StreamMode::Capture => self.capture_ready()?,
            };
            let enough = match self.config.mode {
                StreamMode::Playback => ready >= period,
                StreamMode::Capture => ready > 0,
            };
            if enough {
                return Ok(ready.min(self.config.buffer_frames));
            }
            unsafe {
                let _ = WaitForSingleObject(self.event.0, quantum_ms.max(1));
            }
        }
    }

    fn transfer(
        &mut self,
        frames: usize,
        exchange: &mut FrameSource<'_>,
    ) -> Result<(), DeviceError> {
        let kind = BackendKind::Wasapi;
        let bytes_per_frame = self.config.spec.bytes_per_frame();

        match &self.service {
            ClientService::Render(render) => unsafe {
                let data = render
                    .GetBuffer(frames as u32)
                    .map_err(|e| DeviceError::BufferMap {
                        backend: kind,
                        message: e.to_string(),
                    })?;
                let region = std::slice::from_raw_parts_mut(data, frames * bytes_per_frame);
                exchange(region, frames);
                render
                    .ReleaseBuffer(frames as u32, 0)
                    .map_err(|e| win_err(kind, "release", e))
            },
            ClientService::Capture(capture) => unsafe {
                let mut consumed = 0usize;
                while consumed < frames {
                    let mut data: *mut u8 = std::ptr::null_mut();
                    let mut packet_frames = 0u32;
                    let mut flags = 0u32;
                    capture
                        .GetBuffer(&mut data, &mut packet_frames, &mut flags, None, None)
                        .map_err(|e| DeviceError::BufferMap {
                            backend: kind,
                            message: e.to_string(),
                        })?;
                    if packet_frames == 0 {
                        break;
                    }
                    // Silent-flagged packets are delivered like any other.
                    let region = std::slice::from_raw_parts_mut(
                        data,
                        packet_frames as usize * bytes_per_frame,
                    );
                    exchange(region, packet_frames as usize);
                    capture
                        .ReleaseBuffer(packet_frames)
                        .map_err(|e| win_err(kind, "release", e))?;
                    consumed += packet_frames as usize;
                }
                Ok(())
            },
        }
    }
}
