//! Local audio I/O: microphone capture, cursor-scheduled playback and the
//! cpal device backends behind them.
//!
//! The engines never touch hardware directly. They talk to an
//! [`capture::InputBackend`] / [`playback::OutputBackend`], which keeps the
//! realtime device callbacks on one side of a narrow push interface.

pub mod capture;
pub mod device;
pub mod playback;

pub use capture::{AudioCaptureEngine, CapturePreferences, InputBackend};
pub use device::{CpalInput, CpalOutput};
pub use playback::{AudioPlaybackEngine, OutputBackend, OutputSink, ScheduledBuffer};

/// Errors raised by the audio layer.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No {0} device available")]
    NoDevice(&'static str),
    #[error("Audio device unavailable: {0}")]
    Unavailable(String),
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to run audio stream: {0}")]
    Stream(String),
    #[error("Resampling failed: {0}")]
    Resample(String),
    #[error("Capture is already running")]
    AlreadyRunning,
}
