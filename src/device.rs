//! Devices: lifecycle, control-side operations, and the worker thread.
//!
//! Every device pairs an application-facing handle ([`Device`]) with one
//! dedicated worker thread. The handle drives the state machine
//!
//! ```text
//! Uninitialized -> (open) -> Stopped
//! Stopped  --start--> Starting --worker ack--> Started
//! Started  --stop-->  Stopping --worker ack--> Stopped
//! Stopped  --drop--> Uninitialized
//! ```
//!
//! and the worker runs the endpoint I/O loop between the `Starting` and
//! `Stopping` edges. The state word is a single atomic; the two sides meet
//! only at auto-reset events, so a `start` or `stop` returns exactly when the
//! worker has actually carried the transition out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::backend::{run_io_loop, Backend, BackendKind, DeviceId, Endpoint, Interrupter, Logger};
use crate::config::{
    DataDeliverCallback, DataRequestCallback, DeviceConfig, StoppedCallback, StreamMode,
};
use crate::error::DeviceError;
use crate::pipeline::{Pipeline, StreamSpec};
use crate::sync::AutoResetEvent;

/// Capture deliveries are bounded to this many bytes per callback.
const DELIVERY_CHUNK_BYTES: usize = 4096;

/// Lifecycle state of a device.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// The device has been torn down (observable only during drop).
    Uninitialized = 0,
    /// Initialized and idle.
    Stopped = 1,
    /// `start` has been requested; the worker is bringing the endpoint up.
    Starting = 2,
    /// The worker is inside the endpoint I/O loop.
    Started = 3,
    /// `stop` has been requested; the worker is winding the endpoint down.
    Stopping = 4,
}

impl DeviceState {
    fn from_word(word: u32) -> Self {
        match word {
            1 => DeviceState::Stopped,
            2 => DeviceState::Starting,
            3 => DeviceState::Started,
            4 => DeviceState::Stopping,
            _ => DeviceState::Uninitialized,
        }
    }
}

/// State shared between the device handle and its worker thread.
struct DeviceShared {
    state: AtomicU32,
    /// Serializes control-side entries (`start`, `stop`, teardown).
    control: Mutex<()>,
    /// Worker parks here between runs.
    wakeup: AutoResetEvent,
    /// Worker acknowledges a start attempt (success or failure).
    start_ack: AutoResetEvent,
    /// Worker acknowledges a requested stop.
    stop_ack: AutoResetEvent,
    /// Failure slot for start attempts; never written after `Started`.
    start_result: Mutex<Option<DeviceError>>,
    data_request: RwLock<Option<DataRequestCallback>>,
    data_deliver: RwLock<Option<DataDeliverCallback>>,
    stopped: RwLock<Option<StoppedCallback>>,
}

impl DeviceShared {
    fn state(&self) -> DeviceState {
        DeviceState::from_word(self.state.load(Ordering::SeqCst))
    }

    fn swap_state(&self, next: DeviceState) -> DeviceState {
        DeviceState::from_word(self.state.swap(next as u32, Ordering::SeqCst))
    }

    fn try_transition(&self, from: DeviceState, to: DeviceState) -> Result<(), DeviceState> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(DeviceState::from_word)
    }
}

/// An opened audio device.
///
/// Obtained from [`Context::open_device`](crate::Context::open_device). The
/// device starts out [`Stopped`](DeviceState::Stopped); dropping it stops and
/// tears everything down, joining the worker thread.
///
/// All methods may be called from any thread. Calls that change the lifecycle
/// are serialized internally; a call made from the wrong state fails with the
/// matching [`DeviceError`] without touching the stream.
pub struct Device {
    shared: Arc<DeviceShared>,
    worker: Option<JoinHandle<()>>,
    interrupter: Interrupter,
    /// Keeps the backend's context-level resources alive for as long as any
    /// of its devices exist.
    _backend: Arc<dyn Backend>,
    backend: BackendKind,
    mode: StreamMode,
    client_spec: StreamSpec,
    device_spec: StreamSpec,
    buffer_frames: usize,
    periods: usize,
}

impl Device {
    /// Opens a device on `backend` and spawns its worker.
    pub(crate) fn open(
        backend: Arc<dyn Backend>,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let resolved = config.resolve()?;
        let logger = Logger::new(backend.kind(), config.log.clone());
        let endpoint = backend.open(mode, device, &resolved, logger.clone())?;

        let endpoint_config = endpoint.config().clone();
        debug_assert!(endpoint_config.periods >= 1);
        debug_assert!(endpoint_config.buffer_frames >= endpoint_config.periods);

        let client_spec = resolved.spec.clone();
        let device_spec = endpoint_config.spec.clone();
        let pipeline = match mode {
            StreamMode::Playback => Pipeline::new(client_spec.clone(), device_spec.clone())?,
            StreamMode::Capture => Pipeline::new(device_spec.clone(), client_spec.clone())?,
        };
        if !pipeline.is_passthrough() {
            logger.log(&format!(
                "stream adapted: client {} ch {} Hz {} -> device {} ch {} Hz {}",
                client_spec.channels,
                client_spec.sample_rate,
                client_spec.format,
                device_spec.channels,
                device_spec.sample_rate,
                device_spec.format,
            ));
        }

        let shared = Arc::new(DeviceShared {
            state: AtomicU32::new(DeviceState::Stopped as u32),
            control: Mutex::new(()),
            wakeup: AutoResetEvent::new(),
            start_ack: AutoResetEvent::new(),
            stop_ack: AutoResetEvent::new(),
            start_result: Mutex::new(None),
            data_request: RwLock::new(config.data_request.clone()),
            data_deliver: RwLock::new(config.data_deliver.clone()),
            stopped: RwLock::new(config.stopped.clone()),
        });

        let interrupter = endpoint.interrupter();
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("audio-{}", backend.kind()))
                .spawn(move || worker_main(&shared, endpoint, pipeline, logger))
                .map_err(|e| DeviceError::ThreadCreation {
                    reason: e.to_string(),
                })?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
            interrupter,
            backend: backend.kind(),
            _backend: backend,
            mode,
            client_spec,
            device_spec,
            buffer_frames: endpoint_config.buffer_frames,
            periods: endpoint_config.periods,
        })
    }

    /// Starts the stream.
    ///
    /// For playback the endpoint buffer is pre-rolled with one full pull from
    /// the data callback before the hardware starts. The call returns once
    /// the worker has entered its I/O loop (the state is then
    /// [`Started`](DeviceState::Started)), or with the start failure.
    ///
    /// # Errors
    ///
    /// Fails with the matching state error when the device is not stopped,
    /// or with the backend's error when the endpoint refuses to start.
    pub fn start(&self) -> Result<(), DeviceError> {
        let _guard = self.shared.control.lock();
        self.shared
            .try_transition(DeviceState::Stopped, DeviceState::Starting)
            .map_err(|current| match current {
                DeviceState::Started => DeviceError::AlreadyStarted,
                DeviceState::Starting => DeviceError::AlreadyStarting,
                DeviceState::Stopping => DeviceError::Busy,
                _ => DeviceError::NotInitialized,
            })?;

        *self.shared.start_result.lock() = None;
        self.shared.wakeup.signal();
        self.shared.start_ack.wait();

        match self.shared.start_result.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stops the stream.
    ///
    /// Interrupts the worker's blocking wait and returns once the worker has
    /// left the I/O loop, stopped the endpoint, published
    /// [`Stopped`](DeviceState::Stopped), and delivered the `stopped`
    /// callback on its thread.
    ///
    /// # Errors
    ///
    /// Fails with the matching state error when the device is not started.
    pub fn stop(&self) -> Result<(), DeviceError> {
        let _guard = self.shared.control.lock();
        self.shared
            .try_transition(DeviceState::Started, DeviceState::Stopping)
            .map_err(|current| match current {
                DeviceState::Stopped => DeviceError::AlreadyStopped,
                DeviceState::Stopping => DeviceError::AlreadyStopping,
                DeviceState::Starting => DeviceError::Busy,
                _ => DeviceError::NotInitialized,
            })?;

        self.interrupter.interrupt();
        self.shared.stop_ack.wait();
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    /// True while the worker runs the I/O loop.
    pub fn is_started(&self) -> bool {
        self.state() == DeviceState::Started
    }

    /// Direction of this device.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Which backend the device runs on.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// The stream description the application callbacks see.
    pub fn client_spec(&self) -> &StreamSpec {
        &self.client_spec
    }

    /// The stream description the endpoint actually negotiated.
    pub fn device_spec(&self) -> &StreamSpec {
        &self.device_spec
    }

    /// Endpoint buffer length in frames.
    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    /// Number of periods the endpoint buffer is divided into.
    pub fn periods(&self) -> usize {
        self.periods
    }

    /// Installs or clears the playback data callback.
    ///
    /// Publication is atomic with respect to the worker: every invocation
    /// sees a value that was fully installed at or before it.
    pub fn set_data_request_callback(&self, callback: Option<DataRequestCallback>) {
        *self.shared.data_request.write() = callback;
    }

    /// Installs or clears the capture data callback.
    pub fn set_data_deliver_callback(&self, callback: Option<DataDeliverCallback>) {
        *self.shared.data_deliver.write() = callback;
    }

    /// Installs or clears the stop-notification callback.
    pub fn set_stopped_callback(&self, callback: Option<StoppedCallback>) {
        *self.shared.stopped.write() = callback;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Teardown is unconditional: stop if running, then release the worker.
        let _ = self.stop();
        {
            let _guard = self.shared.control.lock();
            self.shared.swap_state(DeviceState::Uninitialized);
        }
        self.shared.wakeup.signal();
        self.interrupter.interrupt();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.backend)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("buffer_frames", &self.buffer_frames)
            .field("periods", &self.periods)
            .finish_non_exhaustive()
    }
}

/// The worker thread: parks on `wakeup`, runs one start/loop/stop cycle per
/// request, exits when the device is torn down.
fn worker_main(
    shared: &Arc<DeviceShared>,
    mut endpoint: Box<dyn Endpoint>,
    mut pipeline: Pipeline,
    logger: Logger,
) {
    let interrupter = endpoint.interrupter();
    let mode = endpoint.config().mode;

    loop {
        shared.wakeup.wait();
        match shared.state() {
            DeviceState::Uninitialized => break,
            DeviceState::Starting => {}
            // Spurious wakeup (e.g. teardown racing a finished stop).
            _ => continue,
        }

        interrupter.clear();
        pipeline.reset();

        let cycle = run_cycle(shared, endpoint.as_mut(), &mut pipeline, mode, &logger);
        if let Err(error) = cycle {
            // Failures before `Started` go to the caller through the result
            // slot, acknowledged on the start event.
            logger.log(&format!("start failed: {error}"));
            *shared.start_result.lock() = Some(error);
            shared.swap_state(DeviceState::Stopped);
            shared.start_ack.signal();
            continue;
        }

        if let Err(error) = endpoint.stop() {
            logger.log(&format!("stop failed: {error}"));
        }

        let previous = shared.swap_state(DeviceState::Stopped);

        // Deliver the stopped notification before acknowledging the stop, so
        // a `stop()` call observes the callback completed by the time it
        // returns.
        let stopped = shared.stopped.read().clone();
        if let Some(callback) = stopped {
            callback();
        }

        if previous == DeviceState::Stopping {
            shared.stop_ack.signal();
        }
    }
}

/// One start-to-stop cycle. Returns `Err` only for failures before `Started`
/// was published; later failures end the loop and are reported via the log.
fn run_cycle(
    shared: &Arc<DeviceShared>,
    endpoint: &mut dyn Endpoint,
    pipeline: &mut Pipeline,
    mode: StreamMode,
    logger: &Logger,
) -> Result<(), DeviceError> {
    match mode {
        StreamMode::Playback => {
            let client_bpf = pipeline.input().bytes_per_frame();
            let mut upstream = |buf: &mut [u8], frames: usize| -> usize {
                let bytes = frames * client_bpf;
                buf[..bytes].fill(0);
                let callback = shared.data_request.read().clone();
                if let Some(callback) = callback {
                    let written = callback(&mut buf[..bytes], frames);
                    debug_assert!(written <= frames);
                }
                // Shortfalls were pre-zeroed; the device always gets a full
                // buffer of valid frames.
                frames
            };
            let mut exchange =
                |region: &mut [u8], frames: usize| pipeline.read(region, frames, &mut upstream);

            endpoint.start(&mut exchange)?;
            publish_started(shared);

            let result = run_io_loop(endpoint, &mut exchange);
            if let Err(error) = result {
                logger.log(&format!("playback loop ended: {error}"));
            }
        }
        StreamMode::Capture => {
            let device_bpf = pipeline.input().bytes_per_frame();
            let client_bpf = pipeline.output().bytes_per_frame();
            let chunk_frames = (DELIVERY_CHUNK_BYTES / client_bpf).max(1);
            let mut delivery = crate::format::AlignedScratch::new(chunk_frames * client_bpf);

            let mut exchange = |region: &mut [u8], frames: usize| -> usize {
                let mut consumed = 0usize;
                loop {
                    let mut upstream = |dst: &mut [u8], want: usize| -> usize {
                        let give = want.min(frames - consumed);
                        let bytes = give * device_bpf;
                        dst[..bytes]
                            .copy_from_slice(&region[consumed * device_bpf..][..bytes]);
                        consumed += give;
                        give
                    };
                    let got = pipeline.read(delivery.as_bytes_mut(), chunk_frames, &mut upstream);
                    if got == 0 {
                        break;
                    }
                    let callback = shared.data_deliver.read().clone();
                    if let Some(callback) = callback {
                        callback(&delivery.as_bytes()[..got * client_bpf], got);
                    }
                }
                frames
            };

            let mut no_preroll = |_: &mut [u8], _: usize| 0usize;
            endpoint.start(&mut no_preroll)?;
            publish_started(shared);

            let result = run_io_loop(endpoint, &mut exchange);
            if let Err(error) = result {
                logger.log(&format!("capture loop ended: {error}"));
            }
        }
    }
    Ok(())
}

fn publish_started(shared: &Arc<DeviceShared>) {
    shared.swap_state(DeviceState::Started);
    shared.start_ack.signal();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crate::config::{data_request_callback, stopped_callback};
    use crate::format::SampleFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn null_backend() -> Arc<dyn Backend> {
        Arc::new(NullBackend::new())
    }

    fn small_config() -> DeviceConfig {
        DeviceConfig {
            format: SampleFormat::S16,
            channels: 2,
            sample_rate: 48_000,
            buffer_frames: 480, // 10 ms, 5 ms periods
            ..Default::default()
        }
    }

    #[test]
    fn test_open_leaves_device_stopped() {
        let device = Device::open(null_backend(), StreamMode::Playback, None, &small_config())
            .unwrap();
        assert_eq!(device.state(), DeviceState::Stopped);
        assert!(!device.is_started());
        assert_eq!(device.backend(), BackendKind::Null);
    }

    #[test]
    fn test_defaults_follow_sample_rate() {
        let config = DeviceConfig {
            sample_rate: 48_000,
            ..Default::default()
        };
        let device = Device::open(null_backend(), StreamMode::Playback, None, &config).unwrap();
        assert_eq!(device.buffer_frames(), 1200);
        assert_eq!(device.periods(), 2);
    }

    #[test]
    fn test_start_stop_cycle() {
        let device = Device::open(null_backend(), StreamMode::Playback, None, &small_config())
            .unwrap();
        device.start().unwrap();
        assert_eq!(device.state(), DeviceState::Started);
        device.stop().unwrap();
        assert_eq!(device.state(), DeviceState::Stopped);

        // A second full cycle works on the same device.
        device.start().unwrap();
        device.stop().unwrap();
    }

    #[test]
    fn test_illegal_transitions_leave_state_alone() {
        let device = Device::open(null_backend(), StreamMode::Playback, None, &small_config())
            .unwrap();

        assert!(matches!(
            device.stop().unwrap_err(),
            DeviceError::AlreadyStopped
        ));
        assert_eq!(device.state(), DeviceState::Stopped);

        device.start().unwrap();
        assert!(matches!(
            device.start().unwrap_err(),
            DeviceError::AlreadyStarted
        ));
        assert_eq!(device.state(), DeviceState::Started);
        device.stop().unwrap();
    }

    #[test]
    fn test_playback_prerolls_full_buffer_before_started() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let config = DeviceConfig {
            format: SampleFormat::F32,
            channels: 1,
            sample_rate: 44_100,
            buffer_frames: 4410,
            data_request: Some({
                let pulled = Arc::clone(&pulled);
                data_request_callback(move |_, frames| {
                    pulled.fetch_add(frames, Ordering::SeqCst);
                    frames
                })
            }),
            ..Default::default()
        };
        let device = Device::open(null_backend(), StreamMode::Playback, None, &config).unwrap();
        device.start().unwrap();
        assert!(pulled.load(Ordering::SeqCst) >= 4410);
        assert_eq!(device.state(), DeviceState::Started);
        device.stop().unwrap();
    }

    #[test]
    fn test_data_callback_sees_zeroed_buffer() {
        let clean = Arc::new(AtomicUsize::new(0));
        let config = DeviceConfig {
            buffer_frames: 480,
            data_request: Some({
                let clean = Arc::clone(&clean);
                data_request_callback(move |buf, frames| {
                    if buf.iter().all(|&b| b == 0) {
                        clean.fetch_add(1, Ordering::SeqCst);
                    }
                    // Write only half; the rest must stay zero-filled.
                    let half = buf.len() / 2;
                    buf[..half].fill(0x7F);
                    frames / 2
                })
            }),
            ..small_config()
        };
        let device = Device::open(null_backend(), StreamMode::Playback, None, &config).unwrap();
        device.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        device.stop().unwrap();
        assert!(clean.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_stopped_callback_fires_once_per_cycle() {
        let stops = Arc::new(AtomicUsize::new(0));
        let config = DeviceConfig {
            stopped: Some({
                let stops = Arc::clone(&stops);
                stopped_callback(move || {
                    stops.fetch_add(1, Ordering::SeqCst);
                })
            }),
            ..small_config()
        };
        let device = Device::open(null_backend(), StreamMode::Playback, None, &config).unwrap();

        device.start().unwrap();
        device.stop().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        device.start().unwrap();
        device.stop().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callbacks_installable_at_runtime() {
        let device = Device::open(null_backend(), StreamMode::Playback, None, &small_config())
            .unwrap();
        let pulled = Arc::new(AtomicUsize::new(0));
        device.set_data_request_callback(Some({
            let pulled = Arc::clone(&pulled);
            data_request_callback(move |_, frames| {
                pulled.fetch_add(frames, Ordering::SeqCst);
                frames
            })
        }));

        device.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        device.stop().unwrap();
        assert!(pulled.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_capture_delivers_chunks() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let config = DeviceConfig {
            data_deliver: Some({
                let delivered = Arc::clone(&delivered);
                crate::config::data_deliver_callback(move |_, frames| {
                    delivered.fetch_add(frames, Ordering::SeqCst);
                })
            }),
            ..small_config()
        };
        let device = Device::open(null_backend(), StreamMode::Capture, None, &config).unwrap();
        device.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        device.stop().unwrap();
        // 30 ms at 48 kHz is 1440 frames; allow generous scheduling slack.
        assert!(delivered.load(Ordering::SeqCst) >= 480);
    }

    #[test]
    fn test_drop_while_started_joins_cleanly() {
        let device = Device::open(null_backend(), StreamMode::Playback, None, &small_config())
            .unwrap();
        device.start().unwrap();
        drop(device); // must stop, join, and not hang
    }

    #[test]
    fn test_stop_latency_is_bounded() {
        // One second buffer; period is 500 ms. Stop must not wait for the
        // buffer to drain, only for the interrupt to be honored.
        let config = DeviceConfig {
            buffer_frames: 48_000,
            ..small_config()
        };
        let device = Device::open(null_backend(), StreamMode::Playback, None, &config).unwrap();
        device.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let begun = std::time::Instant::now();
        device.stop().unwrap();
        assert!(begun.elapsed() < Duration::from_millis(600));
    }
}
