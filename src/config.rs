//! Device configuration and application callbacks.

use std::sync::Arc;

use crate::error::DeviceError;
use crate::format::channel::{self, Channel, MAX_CHANNELS};
use crate::format::SampleFormat;
use crate::pipeline::StreamSpec;

/// Direction of a device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamMode {
    /// Frames flow from the application to the device.
    #[default]
    Playback,
    /// Frames flow from the device to the application.
    Capture,
}

/// Playback data callback.
///
/// Invoked on the device worker thread with an interleaved frame buffer in
/// the device's application-facing format. Writes up to the given frame count
/// and returns how many frames it produced; the library zero-fills any
/// shortfall.
pub type DataRequestCallback = Arc<dyn Fn(&mut [u8], usize) -> usize + Send + Sync>;

/// Capture data callback.
///
/// Invoked on the device worker thread with captured interleaved frames in
/// the application-facing format, in bounded chunks.
pub type DataDeliverCallback = Arc<dyn Fn(&[u8], usize) + Send + Sync>;

/// Invoked from the worker thread once per started-to-stopped transition.
pub type StoppedCallback = Arc<dyn Fn() + Send + Sync>;

/// Receives one UTF-8 log line per call, prefixed with the backend name.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Wraps a closure as a [`DataRequestCallback`] without spelling out the Arc.
pub fn data_request_callback<F>(f: F) -> DataRequestCallback
where
    F: Fn(&mut [u8], usize) -> usize + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as a [`DataDeliverCallback`].
pub fn data_deliver_callback<F>(f: F) -> DataDeliverCallback
where
    F: Fn(&[u8], usize) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as a [`StoppedCallback`].
pub fn stopped_callback<F>(f: F) -> StoppedCallback
where
    F: Fn() + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as a [`LogCallback`].
pub fn log_callback<F>(f: F) -> LogCallback
where
    F: Fn(&str) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Default endpoint buffer length when none is requested.
const DEFAULT_BUFFER_MILLIS: u32 = 25;

/// Default number of periods the endpoint buffer is divided into.
const DEFAULT_PERIODS: u32 = 2;

/// The application's preferred stream description for a device.
///
/// Everything here is a *request*. The backend negotiates what the endpoint
/// actually runs at, and the device bridges the difference internally; the
/// callbacks always see this configuration's format, channels and rate.
///
/// Zero values for `buffer_frames` and `periods` select the documented
/// defaults (25 ms and 2). Backends may adjust defaulted values further to
/// match native constraints.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Preferred sample format.
    pub format: SampleFormat,
    /// Preferred channel count, 1 to 18.
    pub channels: u16,
    /// Preferred sample rate in Hz.
    pub sample_rate: u32,
    /// Preferred channel layout. Empty selects the default map for
    /// `channels`; entries must be unique apart from unassigned slots.
    pub channel_map: Vec<Channel>,
    /// Endpoint buffer length in frames; 0 selects a 25 ms buffer.
    pub buffer_frames: u32,
    /// Number of periods in the endpoint buffer; 0 selects 2.
    pub periods: u32,
    /// Playback data source.
    pub data_request: Option<DataRequestCallback>,
    /// Capture data sink.
    pub data_deliver: Option<DataDeliverCallback>,
    /// Stop notification.
    pub stopped: Option<StoppedCallback>,
    /// Log line sink.
    pub log: Option<LogCallback>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16,
            channels: 2,
            sample_rate: 48_000,
            channel_map: Vec::new(),
            buffer_frames: 0,
            periods: 0,
            data_request: None,
            data_deliver: None,
            stopped: None,
            log: None,
        }
    }
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("format", &self.format)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("channel_map", &self.channel_map)
            .field("buffer_frames", &self.buffer_frames)
            .field("periods", &self.periods)
            .field("data_request", &self.data_request.is_some())
            .field("data_deliver", &self.data_deliver.is_some())
            .field("stopped", &self.stopped.is_some())
            .field("log", &self.log.is_some())
            .finish()
    }
}

impl DeviceConfig {
    /// Validates the request and applies the documented defaults.
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig, DeviceError> {
        if self.channels == 0 || usize::from(self.channels) > MAX_CHANNELS {
            return Err(DeviceError::invalid_config(format!(
                "channel count {} is out of range 1..={MAX_CHANNELS}",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(DeviceError::invalid_config("sample rate must be positive"));
        }

        let channel_map = if self.channel_map.is_empty() {
            channel::default_channel_map(self.channels)
        } else {
            if self.channel_map.len() != usize::from(self.channels) {
                return Err(DeviceError::invalid_config(
                    "channel map length must match the channel count",
                ));
            }
            for (i, position) in self.channel_map.iter().enumerate() {
                if *position != Channel::None && self.channel_map[..i].contains(position) {
                    return Err(DeviceError::invalid_config(format!(
                        "duplicate channel position {position:?}"
                    )));
                }
            }
            self.channel_map.clone()
        };

        let buffer_defaulted = self.buffer_frames == 0;
        let buffer_frames = if buffer_defaulted {
            (self.sample_rate / 1000 * DEFAULT_BUFFER_MILLIS).max(1) as usize
        } else {
            self.buffer_frames as usize
        };

        let periods_defaulted = self.periods == 0;
        let periods = if periods_defaulted {
            DEFAULT_PERIODS as usize
        } else {
            self.periods as usize
        };

        if buffer_frames < periods {
            return Err(DeviceError::invalid_config(format!(
                "buffer of {buffer_frames} frames cannot hold {periods} periods"
            )));
        }

        Ok(ResolvedConfig {
            spec: StreamSpec {
                format: self.format,
                channels: usize::from(self.channels),
                sample_rate: self.sample_rate,
                channel_map,
            },
            buffer_frames,
            periods,
            buffer_defaulted,
            periods_defaulted,
        })
    }
}

/// A validated configuration with defaults applied.
///
/// The `*_defaulted` flags tell backends which values came from defaults and
/// may be adjusted to native constraints, versus explicit requests that
/// should be honored as closely as possible.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub spec: StreamSpec,
    pub buffer_frames: usize,
    pub periods: usize,
    pub buffer_defaulted: bool,
    pub periods_defaulted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_resolves() {
        let resolved = DeviceConfig::default().resolve().unwrap();
        assert_eq!(resolved.spec.format, SampleFormat::S16);
        assert_eq!(resolved.spec.channels, 2);
        assert_eq!(resolved.spec.sample_rate, 48_000);
        // 25 ms at 48 kHz.
        assert_eq!(resolved.buffer_frames, 1200);
        assert_eq!(resolved.periods, 2);
        assert!(resolved.buffer_defaulted);
        assert!(resolved.periods_defaulted);
    }

    #[test]
    fn test_explicit_buffer_and_periods_kept() {
        let config = DeviceConfig {
            buffer_frames: 4410,
            periods: 3,
            sample_rate: 44_100,
            ..Default::default()
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.buffer_frames, 4410);
        assert_eq!(resolved.periods, 3);
        assert!(!resolved.buffer_defaulted);
        assert!(!resolved.periods_defaulted);
    }

    #[test]
    fn test_empty_channel_map_gets_default() {
        let config = DeviceConfig {
            channels: 6,
            ..Default::default()
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.spec.channel_map, channel::default_channel_map(6));
    }

    #[test]
    fn test_zero_channels_rejected() {
        let config = DeviceConfig {
            channels: 0,
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_too_many_channels_rejected() {
        let config = DeviceConfig {
            channels: 19,
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let config = DeviceConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_wrong_map_length_rejected() {
        let config = DeviceConfig {
            channels: 2,
            channel_map: vec![Channel::FrontLeft],
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_duplicate_positions_rejected() {
        let config = DeviceConfig {
            channels: 2,
            channel_map: vec![Channel::FrontLeft, Channel::FrontLeft],
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_unassigned_slots_may_repeat() {
        let config = DeviceConfig {
            channels: 7,
            channel_map: vec![Channel::None; 7],
            ..Default::default()
        };
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn test_buffer_smaller_than_periods_rejected() {
        let config = DeviceConfig {
            buffer_frames: 2,
            periods: 4,
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_debug_output_hides_callbacks() {
        let config = DeviceConfig {
            data_request: Some(data_request_callback(|_, frames| frames)),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("data_request: true"));
        assert!(debug.contains("stopped: false"));
    }
}
