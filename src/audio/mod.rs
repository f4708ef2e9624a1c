//! Audio capture for streaming recognition
//!
//! The platform side is reduced to a small device contract
//! ([`AudioDevice`] / [`AudioSource`]): open at a sample rate, blocking reads
//! of raw PCM16 mono little-endian bytes, release. [`CpalDevice`] implements
//! it for the default microphone; [`AudioCaptureBuffer`] runs the capture
//! loop on top of any implementation.

mod capture;
mod device;

pub use capture::{AudioCaptureBuffer, CaptureError, CaptureState, PAUSE_THRESHOLD};
pub use device::{downsample, CpalDevice};

/// Errors reported by an audio device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    /// The device cannot run at (an integer multiple of) the requested rate
    UnsupportedSampleRate { device: u32, requested: u32 },
    StreamCreationFailed(String),
    /// No audio arrived within the read timeout
    ReadTimeout,
    /// The device stream ended
    StreamClosed,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::UnsupportedSampleRate { device, requested } => write!(
                f,
                "Device rate {} Hz cannot be converted to {} Hz",
                device, requested
            ),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::ReadTimeout => write!(f, "Timed out waiting for audio"),
            AudioError::StreamClosed => write!(f, "Audio stream closed"),
        }
    }
}

impl std::error::Error for AudioError {}

/// An opened audio input
///
/// Owned by the capture loop thread; `read` may block.
pub trait AudioSource: Send {
    /// Read PCM16 mono little-endian bytes into `buf`, returning the count.
    /// Blocks until audio is available.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    /// Release the underlying device. Must be idempotent.
    fn release(&mut self);
}

/// Factory for [`AudioSource`]s
pub trait AudioDevice: Send + Sync + 'static {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioSource>, AudioError>;
}
