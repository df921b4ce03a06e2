//! # device-audio
//!
//! Low-level portable audio device I/O.
//!
//! `device-audio` opens playback and capture endpoints on whichever native
//! audio subsystem the host provides (DirectSound, WASAPI, ALSA, OpenSL ES,
//! OpenAL, or a silent null device), runs a dedicated worker thread per
//! device, and transparently adapts the stream description the application
//! asked for to whatever the endpoint actually negotiated — sample format,
//! channel count, channel layout and sample rate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use device_audio::{data_request_callback, Context, DeviceConfig, SampleFormat, StreamMode};
//!
//! let context = Context::new()?;
//!
//! let config = DeviceConfig {
//!     format: SampleFormat::F32,
//!     channels: 2,
//!     sample_rate: 48_000,
//!     data_request: Some(data_request_callback(|buffer, frames| {
//!         // Write up to `frames` interleaved f32 stereo frames.
//!         buffer.fill(0);
//!         frames
//!     })),
//!     ..Default::default()
//! };
//!
//! let device = context.open_device(StreamMode::Playback, None, &config)?;
//! device.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! device.stop()?;
//! # Ok::<(), device_audio::DeviceError>(())
//! ```
//!
//! ## Architecture
//!
//! Each device pairs an application-facing handle with one worker thread:
//!
//! - **Control side**: `start`/`stop` drive an atomic state machine and block
//!   on events until the worker has carried the transition out for real.
//! - **Worker**: waits on the endpoint for period-sized buffer regions and
//!   drives the DSP pipeline over them, in both directions.
//! - **DSP pipeline**: a pull-based chain of format conversion, channel
//!   remixing, position remapping and linear sample rate conversion that
//!   collapses to a direct passthrough when both sides already agree.
//!
//! Callbacks run on the worker thread and must not block; anything slow
//! belongs on the far side of a queue the callback feeds.

#![warn(missing_docs)]
// Audio code converts between sample formats constantly; these casts are the
// point, not an accident.
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]

mod backend;
mod config;
mod context;
mod device;
mod error;
pub mod format;
mod pipeline;
mod sync;

pub use backend::{BackendKind, DeviceId, DeviceInfo};
pub use config::{
    data_deliver_callback, data_request_callback, log_callback, stopped_callback,
    DataDeliverCallback, DataRequestCallback, DeviceConfig, LogCallback, StoppedCallback,
    StreamMode,
};
pub use context::Context;
pub use device::{Device, DeviceState};
pub use error::DeviceError;
pub use format::channel::{Channel, MixMode, MAX_CHANNELS};
pub use format::resample::{ResampleAlgorithm, Resampler, ResamplerConfig};
pub use format::SampleFormat;
pub use pipeline::{Pipeline, StreamSpec};
