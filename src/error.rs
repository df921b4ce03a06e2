//! Error types for device-audio.
//!
//! Every fallible operation in the crate returns [`DeviceError`]. The variants
//! are grouped the way callers tend to handle them:
//! - **Argument/state errors** are programming mistakes (bad config, calling
//!   `start` twice) and are always safe to treat as bugs.
//! - **Resource errors** mean the OS refused a primitive (thread, event).
//! - **Capability errors** mean the request cannot be satisfied on this host.
//! - **Backend errors** carry the backend name and the native diagnostic so
//!   log lines can be correlated with OS-level tooling.

use crate::backend::BackendKind;

/// Errors returned by context and device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// An argument was structurally invalid (null-sized buffer, empty name).
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: String,
    },

    /// The device configuration failed validation.
    #[error("invalid device configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// The device has not been initialized, or has already been torn down.
    #[error("device is not initialized")]
    NotInitialized,

    /// The device is mid-transition and cannot accept this call right now.
    #[error("device is busy")]
    Busy,

    /// `start` was called on a device that is already started.
    #[error("device is already started")]
    AlreadyStarted,

    /// `start` was called while a previous `start` is still in flight.
    #[error("device is already starting")]
    AlreadyStarting,

    /// `stop` was called on a device that is already stopped.
    #[error("device is already stopped")]
    AlreadyStopped,

    /// `stop` was called while a previous `stop` is still in flight.
    #[error("device is already stopping")]
    AlreadyStopping,

    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The OS could not create a mutex.
    #[error("failed to create mutex")]
    MutexCreation,

    /// The OS could not create an event object.
    #[error("failed to create event")]
    EventCreation,

    /// The OS could not spawn the device worker thread.
    #[error("failed to create worker thread: {reason}")]
    ThreadCreation {
        /// The OS-level failure description.
        reason: String,
    },

    /// The endpoint forced a format the converters cannot produce.
    #[error("sample format not supported")]
    FormatNotSupported,

    /// No backend in the preference list could be initialized.
    #[error("no usable audio backend")]
    NoBackend,

    /// No device matched the requested identifier, or none exists at all.
    #[error("no such audio device")]
    NoDevice,

    /// A required native API entry point is missing on this host.
    #[error("audio API not found: {api}")]
    ApiNotFound {
        /// Name of the missing API or symbol.
        api: String,
    },

    /// The backend's context-level initialization failed.
    #[error("[{backend}] failed to initialize backend: {message}")]
    BackendInit {
        /// The backend that failed.
        backend: BackendKind,
        /// The native diagnostic.
        message: String,
    },

    /// Mapping or locking the endpoint buffer failed.
    #[error("[{backend}] failed to map device buffer: {message}")]
    BufferMap {
        /// The backend that failed.
        backend: BackendKind,
        /// The native diagnostic.
        message: String,
    },

    /// The application data callback could not be serviced.
    #[error("failed to read data from client callback")]
    ClientRead,

    /// The endpoint refused to start.
    #[error("[{backend}] failed to start device: {message}")]
    BackendStart {
        /// The backend that failed.
        backend: BackendKind,
        /// The native diagnostic.
        message: String,
    },

    /// The endpoint refused to stop.
    #[error("[{backend}] failed to stop device: {message}")]
    BackendStop {
        /// The backend that failed.
        backend: BackendKind,
        /// The native diagnostic.
        message: String,
    },

    /// Any other backend-qualified failure, kept for diagnostics.
    #[error("[{backend}] {message}")]
    Backend {
        /// The backend that failed.
        backend: BackendKind,
        /// The native diagnostic.
        message: String,
    },
}

impl DeviceError {
    /// Creates a [`DeviceError::InvalidArgument`] with the given reason.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a [`DeviceError::InvalidConfig`] with the given reason.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Creates a backend-qualified diagnostic error.
    pub fn backend(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = DeviceError::invalid_config("channel count 0 is out of range");
        assert_eq!(
            err.to_string(),
            "invalid device configuration: channel count 0 is out of range"
        );
    }

    #[test]
    fn test_backend_error_carries_prefix() {
        let err = DeviceError::BackendStart {
            backend: BackendKind::Null,
            message: "endpoint gone".to_string(),
        };
        assert!(err.to_string().starts_with("[null]"));
        assert!(err.to_string().contains("endpoint gone"));
    }

    #[test]
    fn test_state_errors_are_distinct() {
        assert_ne!(
            DeviceError::AlreadyStarted.to_string(),
            DeviceError::AlreadyStarting.to_string()
        );
        assert_ne!(
            DeviceError::AlreadyStopped.to_string(),
            DeviceError::AlreadyStopping.to_string()
        );
    }
}
