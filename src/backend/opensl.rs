//! OpenSL ES backend (Android).
//!
//! Streams run on Android simple buffer queues: a fixed set of period-sized
//! buffers is kept enqueued, and the engine's completion callback ticks a
//! counter that the worker's bounded wait polls. The engine object itself
//! exists at most once per process, shared through the refcounted registry
//! and destroyed when the last context releases it.
//!
//! No maintained binding crate covers OpenSL ES, so the handful of entry
//! points, vtables and constants used here are declared directly against
//! `libOpenSLES`.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::{
    Backend, BackendKind, DeviceId, DeviceInfo, Endpoint, EndpointConfig, Interrupter, Logger,
    ProcessSingleton,
};
use crate::config::{ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::channel::default_channel_map;
use crate::format::resample::FrameSource;
use crate::format::{AlignedScratch, SampleFormat};
use crate::pipeline::StreamSpec;

mod ffi {
    #![allow(non_snake_case, non_camel_case_types, dead_code)]

    use std::ffi::c_void;

    pub type SLresult = u32;
    pub type SLuint32 = u32;
    pub type SLInterfaceID = *const c_void;

    pub const SL_RESULT_SUCCESS: SLresult = 0;
    pub const SL_BOOLEAN_FALSE: SLuint32 = 0;

    pub const SL_DATALOCATOR_OUTPUTMIX: SLuint32 = 0x0000_0003;
    pub const SL_DATALOCATOR_IODEVICE: SLuint32 = 0x0000_0002;
    pub const SL_DATALOCATOR_ANDROIDSIMPLEBUFFERQUEUE: SLuint32 = 0x8000_07BD;
    pub const SL_DATAFORMAT_PCM: SLuint32 = 0x0000_0002;

    pub const SL_IODEVICE_AUDIOINPUT: SLuint32 = 0x0000_0003;
    pub const SL_DEFAULTDEVICEID_AUDIOINPUT: SLuint32 = 0xFFFF_FFFF;

    pub const SL_PLAYSTATE_STOPPED: SLuint32 = 0x0000_0001;
    pub const SL_PLAYSTATE_PLAYING: SLuint32 = 0x0000_0003;
    pub const SL_RECORDSTATE_STOPPED: SLuint32 = 0x0000_0001;
    pub const SL_RECORDSTATE_RECORDING: SLuint32 = 0x0000_0003;

    pub const SL_BYTEORDER_LITTLEENDIAN: SLuint32 = 0x0000_0002;
    pub const SL_SPEAKER_FRONT_LEFT: SLuint32 = 0x0000_0001;
    pub const SL_SPEAKER_FRONT_RIGHT: SLuint32 = 0x0000_0002;
    pub const SL_SPEAKER_FRONT_CENTER: SLuint32 = 0x0000_0004;

    pub type SLObjectItf = *const *const SLObjectItf_;
    pub type SLEngineItf = *const *const SLEngineItf_;
    pub type SLPlayItf = *const *const SLPlayItf_;
    pub type SLRecordItf = *const *const SLRecordItf_;
    pub type SLBufferQueueItf = *const *const SLBufferQueueItf_;

    pub type BufferQueueCallback =
        unsafe extern "C" fn(caller: SLBufferQueueItf, context: *mut c_void);

    /// SLObjectItf vtable, in declaration order from `OpenSLES.h`.
    #[repr(C)]
    pub struct SLObjectItf_ {
        pub Realize: unsafe extern "C" fn(SLObjectItf, SLuint32) -> SLresult,
        pub Resume: unsafe extern "C" fn(SLObjectItf, SLuint32) -> SLresult,
        pub GetState: unsafe extern "C" fn(SLObjectItf, *mut SLuint32) -> SLresult,
        pub GetInterface:
            unsafe extern "C" fn(SLObjectItf, SLInterfaceID, *mut c_void) -> SLresult,
        pub RegisterCallback: unsafe extern "C" fn(SLObjectItf, *const c_void, *mut c_void)
            -> SLresult,
        pub AbortAsyncOperation: unsafe extern "C" fn(SLObjectItf),
        pub Destroy: unsafe extern "C" fn(SLObjectItf),
        pub SetPriority: unsafe extern "C" fn(SLObjectItf, i32, SLuint32) -> SLresult,
        pub GetPriority: unsafe extern "C" fn(SLObjectItf, *mut i32, *mut SLuint32) -> SLresult,
        pub SetLossOfControlInterfaces:
            unsafe extern "C" fn(SLObjectItf, i16, *mut SLInterfaceID, SLuint32) -> SLresult,
    }

    /// SLEngineItf vtable, in declaration order from `OpenSLES.h`.
    #[repr(C)]
    pub struct SLEngineItf_ {
        pub CreateLEDDevice: unsafe extern "C" fn() -> SLresult,
        pub CreateVibraDevice: unsafe extern "C" fn() -> SLresult,
        pub CreateAudioPlayer: unsafe extern "C" fn(
            SLEngineItf,
            *mut SLObjectItf,
            *mut SLDataSource,
            *mut SLDataSink,
            SLuint32,
            *const SLInterfaceID,
            *const SLuint32,
        ) -> SLresult,
        pub CreateAudioRecorder: unsafe extern "C" fn(
            SLEngineItf,
            *mut SLObjectItf,
            *mut SLDataSource,
            *mut SLDataSink,
            SLuint32,
            *const SLInterfaceID,
            *const SLuint32,
        ) -> SLresult,
        pub CreateMidiPlayer: unsafe extern "C" fn() -> SLresult,
        pub CreateListener: unsafe extern "C" fn() -> SLresult,
        pub Create3DGroup: unsafe extern "C" fn() -> SLresult,
        pub CreateOutputMix: unsafe extern "C" fn(
            SLEngineItf,
            *mut SLObjectItf,
            SLuint32,
            *const SLInterfaceID,
            *const SLuint32,
        ) -> SLresult,
    }

    #[repr(C)]
    pub struct SLPlayItf_ {
        pub SetPlayState: unsafe extern "C" fn(SLPlayItf, SLuint32) -> SLresult,
        pub GetPlayState: unsafe extern "C" fn(SLPlayItf, *mut SLuint32) -> SLresult,
    }

    #[repr(C)]
    pub struct SLRecordItf_ {
        pub SetRecordState: unsafe extern "C" fn(SLRecordItf, SLuint32) -> SLresult,
        pub GetRecordState: unsafe extern "C" fn(SLRecordItf, *mut SLuint32) -> SLresult,
    }

    /// SLAndroidSimpleBufferQueueItf vtable.
    #[repr(C)]
    pub struct SLBufferQueueItf_ {
        pub Enqueue: unsafe extern "C" fn(SLBufferQueueItf, *const c_void, SLuint32) -> SLresult,
        pub Clear: unsafe extern "C" fn(SLBufferQueueItf) -> SLresult,
        pub GetState: unsafe extern "C" fn(SLBufferQueueItf, *mut c_void) -> SLresult,
        pub RegisterCallback:
            unsafe extern "C" fn(SLBufferQueueItf, BufferQueueCallback, *mut c_void) -> SLresult,
    }

    #[repr(C)]
    pub struct SLDataLocator_AndroidSimpleBufferQueue {
        pub locatorType: SLuint32,
        pub numBuffers: SLuint32,
    }

    #[repr(C)]
    pub struct SLDataLocator_OutputMix {
        pub locatorType: SLuint32,
        pub outputMix: SLObjectItf,
    }

    #[repr(C)]
    pub struct SLDataLocator_IODevice {
        pub locatorType: SLuint32,
        pub deviceType: SLuint32,
        pub deviceID: SLuint32,
        pub device: *mut c_void,
    }

    #[repr(C)]
    pub struct SLDataFormat_PCM {
        pub formatType: SLuint32,
        pub numChannels: SLuint32,
        /// Milli-hertz, despite the field's historical name.
        pub samplesPerSec: SLuint32,
        pub bitsPerSample: SLuint32,
        pub containerSize: SLuint32,
        pub channelMask: SLuint32,
        pub endianness: SLuint32,
    }

    #[repr(C)]
    pub struct SLDataSource {
        pub pLocator: *mut c_void,
        pub pFormat: *mut c_void,
    }

    #[repr(C)]
    pub struct SLDataSink {
        pub pLocator: *mut c_void,
        pub pFormat: *mut c_void,
    }

    #[link(name = "OpenSLES")]
    extern "C" {
        pub fn slCreateEngine(
            pEngine: *mut SLObjectItf,
            numOptions: SLuint32,
            pEngineOptions: *const c_void,
            numInterfaces: SLuint32,
            pInterfaceIds: *const SLInterfaceID,
            pInterfaceRequired: *const SLuint32,
        ) -> SLresult;

        pub static SL_IID_ENGINE: SLInterfaceID;
        pub static SL_IID_PLAY: SLInterfaceID;
        pub static SL_IID_RECORD: SLInterfaceID;
        pub static SL_IID_ANDROIDSIMPLEBUFFERQUEUE: SLInterfaceID;
    }
}

use ffi::*;

/// The process-wide OpenSL engine; created on first context, destroyed with
/// the last.
static ENGINE: ProcessSingleton<EngineHandle> = ProcessSingleton::new();

#[derive(Clone, Copy)]
struct EngineHandle {
    object: SLObjectItf,
    engine: SLEngineItf,
}

// The engine object is internally synchronized per the OpenSL ES spec.
unsafe impl Send for EngineHandle {}
unsafe impl Sync for EngineHandle {}

fn sl_check(result: SLresult, context: &str) -> Result<(), DeviceError> {
    if result == SL_RESULT_SUCCESS {
        Ok(())
    } else {
        Err(DeviceError::Backend {
            backend: BackendKind::OpenSl,
            message: format!("{context}: SLresult {result}"),
        })
    }
}

fn acquire_engine() -> Result<EngineHandle, DeviceError> {
    ENGINE.acquire(|| unsafe {
        let mut object: SLObjectItf = std::ptr::null();
        let result = slCreateEngine(
            &mut object,
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            std::ptr::null(),
        );
        if result != SL_RESULT_SUCCESS || object.is_null() {
            return Err(DeviceError::BackendInit {
                backend: BackendKind::OpenSl,
                message: format!("slCreateEngine: SLresult {result}"),
            });
        }
        sl_check(((**object).Realize)(object, SL_BOOLEAN_FALSE), "realize engine")?;

        let mut engine: SLEngineItf = std::ptr::null();
        sl_check(
            ((**object).GetInterface)(
                object,
                SL_IID_ENGINE,
                &mut engine as *mut SLEngineItf as *mut c_void,
            ),
            "engine interface",
        )?;
        Ok(EngineHandle { object, engine })
    })
}

fn release_engine() {
    ENGINE.release(|handle| unsafe {
        ((**handle.object).Destroy)(handle.object);
    });
}

pub(crate) struct OpenSlBackend {
    engine: EngineHandle,
}

impl OpenSlBackend {
    pub(crate) fn new() -> Result<Self, DeviceError> {
        Ok(Self {
            engine: acquire_engine()?,
        })
    }
}

impl Drop for OpenSlBackend {
    fn drop(&mut self) {
        release_engine();
    }
}

impl Backend for OpenSlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenSl
    }

    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        // Android routes through a single logical endpoint per direction.
        let name = match mode {
            StreamMode::Playback => "Android Audio Output",
            StreamMode::Capture => "Android Audio Input",
        };
        Ok(vec![DeviceInfo {
            id: DeviceId::OpenSl(0),
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
            None | Some(DeviceId::OpenSl(0)) => {}
            Some(_) => return Err(DeviceError::NoDevice),
        }

        // Fast-path formats on Android are 16-bit mono/stereo.
        let channels = config.spec.channels.min(2);
        let spec = StreamSpec {
            format: SampleFormat::S16,
            channels,
            sample_rate: config.spec.sample_rate,
            channel_map: default_channel_map(channels as u16),
        };
        let periods = config.periods.max(2);
        let period_frames = (config.buffer_frames / periods).max(1);
        let endpoint_config = EndpointConfig {
            mode,
            spec,
            buffer_frames: period_frames * periods,
            periods,
        };

        let endpoint = OpenSlEndpoint::create(self.engine, endpoint_config, logger)?;
        Ok(Box::new(endpoint))
    }
}

/// Shared with the buffer-queue completion callback.
struct QueueProgress {
    completed: AtomicUsize,
}

unsafe extern "C" fn queue_callback(_caller: SLBufferQueueItf, context: *mut c_void) {
    let progress = &*(context as *const QueueProgress);
    progress.completed.fetch_add(1, Ordering::SeqCst);
}

pub(crate) struct OpenSlEndpoint {
    config: EndpointConfig,
    object: SLObjectItf,
    mix: SLObjectItf,
    play: SLPlayItf,
    record: SLRecordItf,
    queue: SLBufferQueueItf,
    /// One staging buffer per queue slot, round-robin.
    slots: Vec<AlignedScratch>,
    next_slot: usize,
    enqueued: usize,
    /// Capture slots already handed to the exchange closure.
    consumed: usize,
    progress: Box<QueueProgress>,
    interrupter: Interrupter,
    logger: Logger,
    engine_held: bool,
}

unsafe impl Send for OpenSlEndpoint {}

impl OpenSlEndpoint {
    fn create(
        engine: EngineHandle,
        config: EndpointConfig,
        logger: Logger,
    ) -> Result<Self, DeviceError> {
        // The endpoint pins the engine for its own lifetime, independent of
        // the backend that opened it.
        let engine = {
            acquire_engine()?;
            engine
        };

        let channel_mask = match config.spec.channels {
            1 => SL_SPEAKER_FRONT_CENTER,
            _ => SL_SPEAKER_FRONT_LEFT | SL_SPEAKER_FRONT_RIGHT,
        };
        let mut pcm = SLDataFormat_PCM {
            formatType: SL_DATAFORMAT_PCM,
            numChannels: config.spec.channels as u32,
            samplesPerSec: config.spec.sample_rate * 1000,
            bitsPerSample: 16,
            containerSize: 16,
            channelMask: channel_mask,
            endianness: SL_BYTEORDER_LITTLEENDIAN,
        };
        let mut queue_locator = SLDataLocator_AndroidSimpleBufferQueue {
            locatorType: SL_DATALOCATOR_ANDROIDSIMPLEBUFFERQUEUE,
            numBuffers: config.periods as u32,
        };

        let progress = Box::new(QueueProgress {
            completed: AtomicUsize::new(0),
        });

        let mut object: SLObjectItf = std::ptr::null();
        let mut mix: SLObjectItf = std::ptr::null();

        unsafe {
            match config.mode {
                StreamMode::Playback => {
                    sl_check(
                        ((**engine.engine).CreateOutputMix)(
                            engine.engine,
                            &mut mix,
                            0,
                            std::ptr::null(),
                            std::ptr::null(),
                        ),
                        "output mix",
                    )?;
                    sl_check(((**mix).Realize)(mix, SL_BOOLEAN_FALSE), "realize mix")?;

                    let mut mix_locator = SLDataLocator_OutputMix {
                        locatorType: SL_DATALOCATOR_OUTPUTMIX,
                        outputMix: mix,
                    };
                    let mut source = SLDataSource {
                        pLocator: &mut queue_locator as *mut _ as *mut c_void,
                        pFormat: &mut pcm as *mut _ as *mut c_void,
                    };
                    let mut sink = SLDataSink {
                        pLocator: &mut mix_locator as *mut _ as *mut c_void,
                        pFormat: std::ptr::null_mut(),
                    };
                    let interfaces = [SL_IID_ANDROIDSIMPLEBUFFERQUEUE];
                    let required = [1u32];
                    sl_check(
                        ((**engine.engine).CreateAudioPlayer)(
                            engine.engine,
                            &mut object,
                            &mut source,
                            &mut sink,
                            1,
                            interfaces.as_ptr(),
                            required.as_ptr(),
                        ),
                        "audio player",
                    )?;
                }
                StreamMode::Capture => {
                    let mut io_locator = SLDataLocator_IODevice {
                        locatorType: SL_DATALOCATOR_IODEVICE,
                        deviceType: SL_IODEVICE_AUDIOINPUT,
                        deviceID: SL_DEFAULTDEVICEID_AUDIOINPUT,
                        device: std::ptr::null_mut(),
                    };
                    let mut source = SLDataSource {
                        pLocator: &mut io_locator as *mut _ as *mut c_void,
                        pFormat: std::ptr::null_mut(),
                    };
                    let mut sink = SLDataSink {
                        pLocator: &mut queue_locator as *mut _ as *mut c_void,
                        pFormat: &mut pcm as *mut _ as *mut c_void,
                    };
                    let interfaces = [SL_IID_ANDROIDSIMPLEBUFFERQUEUE];
                    let required = [1u32];
                    sl_check(
                        ((**engine.engine).CreateAudioRecorder)(
                            engine.engine,
                            &mut object,
                            &mut source,
                            &mut sink,
                            1,
                            interfaces.as_ptr(),
                            required.as_ptr(),
                        ),
                        "audio recorder",
                    )?;
                }
            }

            sl_check(((**object).Realize)(object, SL_BOOLEAN_FALSE), "realize")?;

            let mut play: SLPlayItf = std::ptr::null();
            let mut record: SLRecordItf = std::ptr::null();
            match config.mode {
                StreamMode::Playback => sl_check(
                    ((**object).GetInterface)(
                        object,
                        SL_IID_PLAY,
                        &mut play as *mut SLPlayItf as *mut c_void,
                    ),
                    "play interface",
                )?,
                StreamMode::Capture => sl_check(
                    ((**object).GetInterface)(
                        object,
                        SL_IID_RECORD,
                        &mut record as *mut SLRecordItf as *mut c_void,
                    ),
                    "record interface",
                )?,
            }

            let mut queue: SLBufferQueueItf = std::ptr::null();
            sl_check(
                ((**object).GetInterface)(
                    object,
                    SL_IID_ANDROIDSIMPLEBUFFERQUEUE,
                    &mut queue as *mut SLBufferQueueItf as *mut c_void,
                ),
                "buffer queue interface",
            )?;
            sl_check(
                ((**queue).RegisterCallback)(
                    queue,
                    queue_callback,
                    &*progress as *const QueueProgress as *mut c_void,
                ),
                "register callback",
            )?;

            let period_bytes =
                (config.buffer_frames / config.periods) * config.spec.bytes_per_frame();
            let slots = (0..config.periods)
                .map(|_| AlignedScratch::new(period_bytes))
                .collect();

            logger.log(&format!(
                "opened endpoint: {} {} ch {} Hz, {} frames x {} periods",
                config.spec.format,
                config.spec.channels,
                config.spec.sample_rate,
                config.buffer_frames,
                config.periods,
            ));

            Ok(Self {
                config,
                object,
                mix,
                play,
                record,
                queue,
                slots,
                next_slot: 0,
                enqueued: 0,
                consumed: 0,
                progress,
                interrupter: Interrupter::new(),
                logger,
                engine_held: true,
            })
        }
    }

    fn in_flight(&self) -> usize {
        self.enqueued
            .saturating_sub(self.progress.completed.load(Ordering::SeqCst))
    }

    /// Enqueues the staging slot at `next_slot` and advances the ring.
    fn enqueue_next(&mut self) -> Result<(), DeviceError> {
        let slot = &self.slots[self.next_slot];
        let bytes = slot.as_bytes();
        unsafe {
            sl_check(
                ((**self.queue).Enqueue)(
                    self.queue,
                    bytes.as_ptr() as *const c_void,
                    bytes.len() as u32,
                ),
                "enqueue",
            )?;
        }
        self.next_slot = (self.next_slot + 1) % self.slots.len();
        self.enqueued += 1;
        Ok(())
    }
}

impl Endpoint for OpenSlEndpoint {
    fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError> {
        let period = self.config.period_frames();
        self.progress.completed.store(0, Ordering::SeqCst);
        self.enqueued = 0;
        self.consumed = 0;
        self.next_slot = 0;

        match self.config.mode {
            StreamMode::Playback => {
                for slot in &mut self.slots {
                    let bytes = slot.as_bytes_mut();
                    bytes.fill(0);
                    preroll(bytes, period);
                }
                for _ in 0..self.slots.len() {
                    self.enqueue_next()?;
                }
                unsafe {
                    sl_check(
                        ((**self.play).SetPlayState)(self.play, SL_PLAYSTATE_PLAYING),
                        "play",
                    )
                    .map_err(|e| DeviceError::BackendStart {
                        backend: BackendKind::OpenSl,
                        message: e.to_string(),
                    })?;
                }
            }
            StreamMode::Capture => {
                for _ in 0..self.slots.len() {
                    self.enqueue_next()?;
                }
                unsafe {
                    sl_check(
                        ((**self.record).SetRecordState)(self.record, SL_RECORDSTATE_RECORDING),
                        "record",
                    )
                    .map_err(|e| DeviceError::BackendStart {
                        backend: BackendKind::OpenSl,
                        message: e.to_string(),
                    })?;
                }
            }
        }
        self.logger.log("device started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        unsafe {
            match self.config.mode {
                StreamMode::Playback => sl_check(
                    ((**self.play).SetPlayState)(self.play, SL_PLAYSTATE_STOPPED),
                    "stop",
                ),
                StreamMode::Capture => sl_check(
                    ((**self.record).SetRecordState)(self.record, SL_RECORDSTATE_STOPPED),
                    "stop",
                ),
            }
            .map_err(|e| DeviceError::BackendStop {
                backend: BackendKind::OpenSl,
                message: e.to_string(),
            })?;
            sl_check(((**self.queue).Clear)(self.queue), "clear queue")?;
        }
        self.progress.completed.store(0, Ordering::SeqCst);
        self.enqueued = 0;
        self.consumed = 0;
        self.next_slot = 0;
        Ok(())
    }

    fn wait(&mut self) -> Result<usize, DeviceError> {
        let period = self.config.period_frames();
        let quantum = self.config.wait_quantum();
        loop {
            if self.interrupter.is_set() {
                return Ok(0);
            }
            let open_slots = match self.config.mode {
                // Playback: slots the device has finished playing.
                StreamMode::Playback => self.slots.len().saturating_sub(self.in_flight()),
                // Capture: slots the device has filled.
                StreamMode::Capture => {
                    let completed = self.progress.completed.load(Ordering::SeqCst);
                    completed.saturating_sub(self.consumed)
                }
            };
            if open_slots > 0 {
                return Ok(open_slots * period);
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
        let slots = (frames / period).max(1);

        for _ in 0..slots {
            match self.config.mode {
                StreamMode::Playback => {
                    let slot = &mut self.slots[self.next_slot];
                    let bytes = slot.as_bytes_mut();
                    bytes.fill(0);
                    exchange(bytes, period);
                    self.enqueue_next()?;
                }
                StreamMode::Capture => {
                    // Hand the filled slot out, then put it back in rotation.
                    let slot = &mut self.slots[self.next_slot];
                    exchange(slot.as_bytes_mut(), period);
                    self.consumed += 1;
                    self.enqueue_next()?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for OpenSlEndpoint {
    fn drop(&mut self) {
        unsafe {
            if !self.object.is_null() {
                ((**self.object).Destroy)(self.object);
            }
            if !self.mix.is_null() {
                ((**self.mix).Destroy)(self.mix);
            }
        }
        if self.engine_held {
            release_engine();
        }
    }
}
