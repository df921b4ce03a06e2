//! The backend contract and the machinery shared by every backend.
//!
//! A backend covers one native audio API. It has two halves:
//! - [`Backend`]: context-level operations — enumeration and opening.
//! - [`Endpoint`]: one opened device — start/stop, bounded waiting, and the
//!   scoped buffer exchange the I/O loop drives.
//!
//! The per-period transfer loop itself is identical across backends, so it
//! lives here ([`run_io_loop`]) and endpoints only implement the primitive
//! operations it composes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{LogCallback, ResolvedConfig, StreamMode};
use crate::error::DeviceError;
use crate::format::resample::FrameSource;
use crate::pipeline::StreamSpec;
use crate::sync::AutoResetEvent;

pub(crate) mod null;

#[cfg(target_os = "linux")]
pub(crate) mod alsa;

#[cfg(windows)]
pub(crate) mod dsound;
#[cfg(windows)]
pub(crate) mod wasapi;

#[cfg(target_os = "android")]
pub(crate) mod opensl;

#[cfg(feature = "openal")]
pub(crate) mod openal;

/// The native audio APIs a context can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// DirectSound (Windows).
    DirectSound,
    /// WASAPI shared mode (Windows).
    Wasapi,
    /// ALSA (Linux).
    Alsa,
    /// OpenSL ES (Android).
    OpenSl,
    /// OpenAL, wherever a runtime library is found (feature `openal`).
    OpenAl,
    /// The silent null backend; always available.
    Null,
}

impl BackendKind {
    /// The order contexts try backends in when no preference is given.
    pub const DEFAULT_ORDER: [BackendKind; 6] = [
        BackendKind::DirectSound,
        BackendKind::Wasapi,
        BackendKind::Alsa,
        BackendKind::OpenSl,
        BackendKind::OpenAl,
        BackendKind::Null,
    ];

    /// Stable lowercase name, used in log prefixes and diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::DirectSound => "dsound",
            BackendKind::Wasapi => "wasapi",
            BackendKind::Alsa => "alsa",
            BackendKind::OpenSl => "opensl",
            BackendKind::OpenAl => "openal",
            BackendKind::Null => "null",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A backend-specific device identifier.
///
/// Opaque to the rest of the crate; only the backend that produced an id can
/// interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    /// WASAPI endpoint path (wide characters, as the OS reports it).
    Wasapi(Vec<u16>),
    /// DirectSound driver GUID.
    DirectSound([u8; 16]),
    /// ALSA PCM name, e.g. `hw:0,0` or `default`.
    Alsa(String),
    /// OpenSL ES device id.
    OpenSl(u32),
    /// OpenAL device specifier string.
    OpenAl(String),
    /// Null backend device index.
    Null(u32),
}

/// One enumerated device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Identifier to pass back when opening.
    pub id: DeviceId,
    /// Human-readable UTF-8 name.
    pub name: String,
    /// Whether the OS considers this the default device for its direction.
    pub is_default: bool,
}

/// The stream description an endpoint actually negotiated, plus its buffer
/// geometry.
#[derive(Debug, Clone)]
pub(crate) struct EndpointConfig {
    pub mode: StreamMode,
    pub spec: StreamSpec,
    pub buffer_frames: usize,
    pub periods: usize,
}

impl EndpointConfig {
    pub(crate) fn period_frames(&self) -> usize {
        (self.buffer_frames / self.periods).max(1)
    }

    /// Upper bound for one blocking wait: a period's worth of time, floored
    /// at one millisecond so break latency stays bounded.
    pub(crate) fn wait_quantum(&self) -> Duration {
        let millis = self.period_frames() as u64 * 1000 / u64::from(self.spec.sample_rate).max(1);
        Duration::from_millis(millis.max(1))
    }
}

/// Cloneable handle that breaks an endpoint out of a blocking wait.
#[derive(Clone, Default)]
pub(crate) struct Interrupter {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    requested: AtomicBool,
    event: AutoResetEvent,
}

impl Interrupter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests the current wait (and the loop around it) to end promptly.
    pub(crate) fn interrupt(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.event.signal();
    }

    /// True once an interrupt has been requested and not yet cleared.
    pub(crate) fn is_set(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Rearms the handle before a fresh run of the loop.
    pub(crate) fn clear(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
        // Drain a stale wakeup left over from a previous interrupt.
        self.inner.event.wait_timeout(Duration::ZERO);
    }

    /// Sleeps up to `timeout`, waking early when interrupted.
    pub(crate) fn sleep(&self, timeout: Duration) {
        if self.is_set() {
            return;
        }
        self.inner.event.wait_timeout(timeout);
    }
}

/// Context-level operations of one native audio API.
pub(crate) trait Backend: Send + Sync {
    /// Which API this is.
    fn kind(&self) -> BackendKind;

    /// Lists devices for one direction. Pure read; no device state changes.
    fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// Acquires an endpoint and negotiates the internal stream description.
    ///
    /// The endpoint is returned stopped; `start` is a separate step.
    fn open(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &ResolvedConfig,
        logger: Logger,
    ) -> Result<Box<dyn Endpoint>, DeviceError>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("kind", &self.kind()).finish()
    }
}

/// One opened device endpoint.
///
/// All methods are called from the device worker thread, except
/// [`Endpoint::interrupter`], whose handle is cloned out once at setup.
pub(crate) trait Endpoint: Send {
    /// The negotiated configuration.
    fn config(&self) -> &EndpointConfig;

    /// Handle that breaks [`Endpoint::wait`] out of its block.
    fn interrupter(&self) -> Interrupter;

    /// Starts the endpoint.
    ///
    /// Playback endpoints must fill their whole buffer with one pull from
    /// `preroll` before the hardware starts, so the first period played
    /// carries real data. Capture endpoints ignore `preroll`.
    fn start(&mut self, preroll: &mut FrameSource<'_>) -> Result<(), DeviceError>;

    /// Stops the endpoint and rewinds its cursor.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Blocks until frames can be exchanged or an interrupt arrives.
    ///
    /// Returns the number of exchangeable frames; returns 0 only when
    /// interrupted. Each block is bounded by the period duration so
    /// interrupts are honored promptly. Recoverable over/underruns are
    /// repaired once internally; a second failure propagates.
    fn wait(&mut self) -> Result<usize, DeviceError>;

    /// Exchanges `frames` frames with the endpoint buffer.
    ///
    /// Each contiguous region (the request may wrap the ring and split) is
    /// passed to `exchange` as `(bytes, frames)`; for playback the closure
    /// fills it, for capture the closure consumes it. The region is released
    /// and the ring cursor advanced on every path, including errors.
    fn transfer(
        &mut self,
        frames: usize,
        exchange: &mut FrameSource<'_>,
    ) -> Result<(), DeviceError>;
}

impl std::fmt::Debug for dyn Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("config", self.config()).finish()
    }
}

/// Drives the period loop of a started endpoint until interrupted.
///
/// The caller clears the interrupter before starting the endpoint; from then
/// on an interrupt is the only clean exit. Errors from the endpoint end the
/// loop and surface to the worker.
pub(crate) fn run_io_loop(
    endpoint: &mut dyn Endpoint,
    exchange: &mut FrameSource<'_>,
) -> Result<(), DeviceError> {
    let interrupter = endpoint.interrupter();
    let playback = endpoint.config().mode == StreamMode::Playback;

    loop {
        let available = endpoint.wait()?;
        if available == 0 {
            if interrupter.is_set() {
                return Ok(());
            }
            continue;
        }
        if playback && interrupter.is_set() {
            // Stop was requested while waiting; do not pull more client data.
            return Ok(());
        }
        endpoint.transfer(available, exchange)?;
    }
}

/// Frame-cursor arithmetic for a logical ring of `size` frames.
///
/// The backend tracks only its own side (the last frame it processed); the
/// hardware side is queried each time. For playback, committed frames are the
/// span from the hardware cursor up to ours; for capture it is the reverse.
#[derive(Debug, Clone)]
pub(crate) struct RingCursor {
    size: usize,
    last_processed: usize,
}

// Which accessors are live depends on the backends compiled in.
#[allow(dead_code)]
impl RingCursor {
    pub(crate) fn new(size: usize) -> Self {
        debug_assert!(size > 0);
        Self {
            size,
            last_processed: 0,
        }
    }

    /// Frame offset of the next region to process.
    pub(crate) fn offset(&self) -> usize {
        self.last_processed
    }

    /// Advances our side of the ring by `frames`.
    pub(crate) fn advance(&mut self, frames: usize) {
        self.last_processed = (self.last_processed + frames) % self.size;
    }

    /// Rewinds to the start of the ring (after a device stop).
    pub(crate) fn reset(&mut self) {
        self.last_processed = 0;
    }

    /// Playback: frames submitted but not yet consumed by the hardware.
    pub(crate) fn committed(&self, hardware: usize) -> usize {
        (self.last_processed + self.size - hardware % self.size) % self.size
    }

    /// Playback: frames we may fill without overwriting unplayed data.
    pub(crate) fn available_to_fill(&self, hardware: usize) -> usize {
        self.size - self.committed(hardware)
    }

    /// Capture: frames recorded by the hardware that we have not consumed.
    pub(crate) fn available_to_read(&self, hardware: usize) -> usize {
        (hardware % self.size + self.size - self.last_processed) % self.size
    }

    /// Splits a `frames`-long region starting at our cursor into at most two
    /// contiguous `(offset, len)` spans.
    pub(crate) fn spans(&self, frames: usize) -> [(usize, usize); 2] {
        let first = frames.min(self.size - self.last_processed);
        [(self.last_processed, first), (0, frames - first)]
    }
}

/// Per-device log sink: structured tracing plus the application callback.
#[derive(Clone)]
pub(crate) struct Logger {
    backend: BackendKind,
    callback: Option<LogCallback>,
}

impl Logger {
    pub(crate) fn new(backend: BackendKind, callback: Option<LogCallback>) -> Self {
        Self { backend, callback }
    }

    /// Emits one log line, prefixed with the backend name for the callback.
    pub(crate) fn log(&self, message: &str) {
        tracing::debug!(backend = self.backend.name(), "{message}");
        if let Some(callback) = &self.callback {
            callback(&format!("[{}] {message}", self.backend));
        }
    }
}

/// A refcounted process-wide singleton.
///
/// Some native engines exist at most once per process (the OpenSL engine
/// object, notably). Contexts acquire the shared value, bumping a refcount;
/// the teardown closure runs exactly when the last holder releases.
// Only backends with process-global native objects reach for this.
#[allow(dead_code)]
pub(crate) struct ProcessSingleton<T> {
    slot: Mutex<Option<(T, u32)>>,
}

#[allow(dead_code)]
impl<T> ProcessSingleton<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

#[allow(dead_code)]
impl<T: Clone> ProcessSingleton<T> {
    /// Returns the shared value, creating it with `init` on first acquire.
    pub(crate) fn acquire(
        &self,
        init: impl FnOnce() -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some((value, count)) => {
                *count += 1;
                Ok(value.clone())
            }
            None => {
                let value = init()?;
                *slot = Some((value.clone(), 1));
                Ok(value)
            }
        }
    }

    /// Drops one reference; runs `teardown` on the stored value when the
    /// count reaches zero.
    pub(crate) fn release(&self, teardown: impl FnOnce(T)) {
        let mut slot = self.slot.lock();
        if let Some((_, count)) = slot.as_mut() {
            *count -= 1;
            if *count == 0 {
                if let Some((value, _)) = slot.take() {
                    teardown(value);
                }
            }
        }
    }

    /// Current reference count, for diagnostics.
    #[cfg(test)]
    pub(crate) fn refcount(&self) -> u32 {
        self.slot.lock().as_ref().map_or(0, |(_, count)| *count)
    }
}

/// Instantiates the backend for `kind`, if it is compiled in and its native
/// API initializes on this host.
pub(crate) fn create(kind: BackendKind) -> Result<Box<dyn Backend>, DeviceError> {
    match kind {
        BackendKind::Null => Ok(Box::new(null::NullBackend::new())),

        #[cfg(target_os = "linux")]
        BackendKind::Alsa => Ok(Box::new(alsa::AlsaBackend::new()?)),

        #[cfg(windows)]
        BackendKind::Wasapi => Ok(Box::new(wasapi::WasapiBackend::new()?)),
        #[cfg(windows)]
        BackendKind::DirectSound => Ok(Box::new(dsound::DsoundBackend::new()?)),

        #[cfg(target_os = "android")]
        BackendKind::OpenSl => Ok(Box::new(opensl::OpenSlBackend::new()?)),

        #[cfg(feature = "openal")]
        BackendKind::OpenAl => Ok(Box::new(openal::OpenAlBackend::new()?)),

        other => Err(DeviceError::ApiNotFound {
            api: other.name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order_ends_with_null() {
        assert_eq!(BackendKind::DEFAULT_ORDER.len(), 6);
        assert_eq!(BackendKind::DEFAULT_ORDER[0], BackendKind::DirectSound);
        assert_eq!(BackendKind::DEFAULT_ORDER[5], BackendKind::Null);
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(BackendKind::DirectSound.name(), "dsound");
        assert_eq!(BackendKind::Wasapi.name(), "wasapi");
        assert_eq!(BackendKind::Alsa.to_string(), "alsa");
        assert_eq!(BackendKind::Null.to_string(), "null");
    }

    #[test]
    fn test_ring_cursor_playback_accounting() {
        let mut ring = RingCursor::new(1000);
        // Empty ring: everything is fillable.
        assert_eq!(ring.committed(0), 0);
        assert_eq!(ring.available_to_fill(0), 1000);

        // Submit 600 frames; hardware has played 100.
        ring.advance(600);
        assert_eq!(ring.committed(100), 500);
        assert_eq!(ring.available_to_fill(100), 500);
    }

    #[test]
    fn test_ring_cursor_wraps() {
        let mut ring = RingCursor::new(100);
        ring.advance(80);
        ring.advance(50);
        assert_eq!(ring.offset(), 30);
        // Hardware at 90: committed spans the wrap.
        assert_eq!(ring.committed(90), 40);
    }

    #[test]
    fn test_ring_cursor_capture_accounting() {
        let mut ring = RingCursor::new(1000);
        // Hardware recorded 300, nothing consumed yet.
        assert_eq!(ring.available_to_read(300), 300);
        ring.advance(300);
        assert_eq!(ring.available_to_read(300), 0);
        // Hardware wrapped past us.
        assert_eq!(ring.available_to_read(50), 750);
    }

    #[test]
    fn test_ring_cursor_spans_split_at_wrap() {
        let mut ring = RingCursor::new(100);
        ring.advance(90);
        let [a, b] = ring.spans(30);
        assert_eq!(a, (90, 10));
        assert_eq!(b, (0, 20));

        let [c, d] = ring.spans(5);
        assert_eq!(c, (90, 5));
        assert_eq!(d.1, 0);
    }

    #[test]
    fn test_ring_cursor_reset() {
        let mut ring = RingCursor::new(64);
        ring.advance(10);
        ring.reset();
        assert_eq!(ring.offset(), 0);
    }

    #[test]
    fn test_interrupter_round_trip() {
        let interrupter = Interrupter::new();
        assert!(!interrupter.is_set());
        interrupter.interrupt();
        assert!(interrupter.is_set());
        interrupter.clear();
        assert!(!interrupter.is_set());
    }

    #[test]
    fn test_interrupter_wakes_sleep_early() {
        let interrupter = Interrupter::new();
        let remote = interrupter.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            remote.interrupt();
        });
        let started = std::time::Instant::now();
        interrupter.sleep(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_quantum_floor() {
        let config = EndpointConfig {
            mode: StreamMode::Playback,
            spec: StreamSpec::new(crate::format::SampleFormat::S16, 2, 48000),
            buffer_frames: 48,
            periods: 2,
        };
        assert_eq!(config.wait_quantum(), Duration::from_millis(1));
    }

    #[test]
    fn test_wait_quantum_tracks_period() {
        let config = EndpointConfig {
            mode: StreamMode::Playback,
            spec: StreamSpec::new(crate::format::SampleFormat::S16, 2, 48000),
            buffer_frames: 9600,
            periods: 2,
        };
        assert_eq!(config.wait_quantum(), Duration::from_millis(100));
    }

    #[test]
    fn test_process_singleton_refcounts() {
        static SINGLETON: ProcessSingleton<u32> = ProcessSingleton::new();

        let a = SINGLETON.acquire(|| Ok(7)).unwrap();
        let b = SINGLETON.acquire(|| panic!("must reuse, not re-init")).unwrap();
        assert_eq!((a, b), (7, 7));
        assert_eq!(SINGLETON.refcount(), 2);

        SINGLETON.release(|_| panic!("count is still positive"));
        assert_eq!(SINGLETON.refcount(), 1);

        let mut torn_down = false;
        SINGLETON.release(|value| {
            assert_eq!(value, 7);
            torn_down = true;
        });
        assert!(torn_down);
        assert_eq!(SINGLETON.refcount(), 0);
    }

    #[test]
    fn test_create_unavailable_backend_reports_api_not_found() {
        // DirectSound can never exist off Windows.
        #[cfg(not(windows))]
        {
            let err = create(BackendKind::DirectSound).unwrap_err();
            assert!(matches!(err, DeviceError::ApiNotFound { .. }));
        }
    }
}
