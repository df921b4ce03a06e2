//! Process-level backend selection and device enumeration.

use std::sync::Arc;

use crate::backend::{self, Backend, BackendKind, DeviceId, DeviceInfo};
use crate::config::{DeviceConfig, StreamMode};
use crate::device::Device;
use crate::error::DeviceError;

/// A handle to one initialized audio backend.
///
/// The context picks the first backend from a preference list whose native
/// API initializes, and every device opened through it runs on that backend.
/// Devices hold a reference to the backend's resources, so the context may be
/// dropped before its devices; the underlying backend is released when the
/// last holder goes away.
///
/// # Example
///
/// ```no_run
/// use device_audio::{Context, DeviceConfig, StreamMode};
///
/// let context = Context::new()?;
/// println!("using {}", context.backend());
/// for device in context.devices(StreamMode::Playback)? {
///     println!("  {} {}", if device.is_default { "*" } else { " " }, device.name);
/// }
/// let device = context.open_device(StreamMode::Playback, None, &DeviceConfig::default())?;
/// device.start()?;
/// # Ok::<(), device_audio::DeviceError>(())
/// ```
pub struct Context {
    backend: Arc<dyn Backend>,
}

impl Context {
    /// Initializes the first working backend in the default order
    /// (`dsound`, `wasapi`, `alsa`, `opensl`, `openal`, `null`).
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NoBackend`] if nothing initializes, which
    /// cannot happen while the null backend is in the list.
    pub fn new() -> Result<Self, DeviceError> {
        Self::with_backends(&BackendKind::DEFAULT_ORDER)
    }

    /// Initializes the first working backend from `preference`.
    ///
    /// Backends that are not compiled for this platform, or whose native API
    /// fails to initialize, are skipped with a log line.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NoBackend`] when every candidate fails.
    pub fn with_backends(preference: &[BackendKind]) -> Result<Self, DeviceError> {
        for &kind in preference {
            match backend::create(kind) {
                Ok(backend) => {
                    tracing::info!(backend = kind.name(), "audio backend initialized");
                    return Ok(Self {
                        backend: Arc::from(backend),
                    });
                }
                Err(error) => {
                    tracing::debug!(
                        backend = kind.name(),
                        error = %error,
                        "backend unavailable, trying next"
                    );
                }
            }
        }
        Err(DeviceError::NoBackend)
    }

    /// Which backend this context runs on.
    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Lists the devices available for one direction.
    ///
    /// # Errors
    ///
    /// Propagates the backend's enumeration failure.
    pub fn devices(&self, mode: StreamMode) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.backend.devices(mode)
    }

    /// Returns the OS default device for one direction, if any.
    ///
    /// # Errors
    ///
    /// Propagates the backend's enumeration failure.
    pub fn default_device(&self, mode: StreamMode) -> Result<Option<DeviceInfo>, DeviceError> {
        let mut devices = self.backend.devices(mode)?;
        let default_at = devices.iter().position(|d| d.is_default);
        Ok(default_at.map(|i| devices.swap_remove(i)))
    }

    /// Opens a device and spawns its worker thread.
    ///
    /// `device` of `None` selects the backend's default endpoint. The device
    /// is returned stopped.
    ///
    /// # Errors
    ///
    /// Returns configuration validation errors, [`DeviceError::NoDevice`]
    /// when the id matches nothing, or the backend's negotiation failure.
    pub fn open_device(
        &self,
        mode: StreamMode,
        device: Option<&DeviceId>,
        config: &DeviceConfig,
    ) -> Result<Device, DeviceError> {
        Device::open(Arc::clone(&self.backend), mode, device, config)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order_always_finds_a_backend() {
        // The null backend terminates the default list, so this never fails.
        let context = Context::new().unwrap();
        let _ = context.backend();
    }

    #[test]
    fn test_explicit_null_backend() {
        let context = Context::with_backends(&[BackendKind::Null]).unwrap();
        assert_eq!(context.backend(), BackendKind::Null);
    }

    #[test]
    fn test_unavailable_backends_are_skipped() {
        #[cfg(not(windows))]
        {
            let context =
                Context::with_backends(&[BackendKind::DirectSound, BackendKind::Null]).unwrap();
            assert_eq!(context.backend(), BackendKind::Null);
        }
    }

    #[test]
    fn test_empty_preference_is_no_backend() {
        let err = Context::with_backends(&[]).unwrap_err();
        assert!(matches!(err, DeviceError::NoBackend));
    }

    #[test]
    fn test_enumeration_and_default_device() {
        let context = Context::with_backends(&[BackendKind::Null]).unwrap();
        let devices = context.devices(StreamMode::Playback).unwrap();
        assert_eq!(devices.len(), 1);

        let default = context.default_device(StreamMode::Capture).unwrap().unwrap();
        assert!(default.is_default);
        assert_eq!(default.id, DeviceId::Null(0));
    }

    #[test]
    fn test_open_device_by_enumerated_id() {
        let context = Context::with_backends(&[BackendKind::Null]).unwrap();
        let info = context.default_device(StreamMode::Playback).unwrap().unwrap();
        let device = context
            .open_device(StreamMode::Playback, Some(&info.id), &DeviceConfig::default())
            .unwrap();
        assert_eq!(device.backend(), BackendKind::Null);
    }

    #[test]
    fn test_context_may_drop_before_device() {
        let context = Context::with_backends(&[BackendKind::Null]).unwrap();
        let device = context
            .open_device(StreamMode::Playback, None, &DeviceConfig::default())
            .unwrap();
        drop(context);
        device.start().unwrap();
        device.stop().unwrap();
    }
}
