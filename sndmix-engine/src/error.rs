//! Error types for the mixer engine
//!
//! Expected errors use `Result<T, E>` with meaningful error enums; render-time
//! errors do not exist by design (rendering is total). Transient conditions
//! (queue ceiling, channel exhaustion) are not errors at all — they are logged
//! and playback continues.

use crate::mixer::MixdownKind;
use thiserror::Error;

/// Main error type for the mixer engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Sound provider errors
    #[error("Sound error: {0}")]
    Sound(#[from] SoundError),

    /// Mixdown creation errors
    #[error("Mixdown error: {0}")]
    Mixdown(#[from] MixdownError),

    /// Audio device errors
    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    /// WAV write errors from the recorder
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors from the decoded-sound provider
#[derive(Debug, Error)]
pub enum SoundError {
    /// WAV container or codec error
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Sample format the provider does not handle
    #[error("Unsupported sample format: {bits}-bit {format} in {path}")]
    UnsupportedFormat {
        bits: u16,
        format: &'static str,
        path: String,
    },

    /// Only mono and stereo sounds are playable
    #[error("Unsupported channel count {channels} in {path}")]
    BadChannelCount { channels: u16, path: String },

    /// A sound with no frames cannot be scheduled
    #[error("Empty sound: {path}")]
    Empty { path: String },
}

/// Errors from mixdown creation
///
/// Creation either succeeds completely or leaves no partial state.
#[derive(Debug, Error)]
pub enum MixdownError {
    /// Buffer size must be a power of two in 32..=32768
    #[error("Invalid buffer size {0} (must be a power of two in 32..=32768)")]
    InvalidBufferSize(usize),

    /// Sample rate outside the supported range
    #[error("Invalid sample rate {0} (must be in 11025..=192000)")]
    InvalidSampleRate(u32),

    /// At most one mixdown of each kind may exist
    #[error("A {0:?} mixdown is already registered")]
    SlotOccupied(MixdownKind),

    /// All mixdowns must share one sample rate
    #[error("Sample rate {requested} conflicts with active rate {active}")]
    RateMismatch { active: u32, requested: u32 },
}

/// Errors from the audio device adapter
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No output device is available
    #[error("No audio output device available")]
    NoDevice,

    /// A device matching the requested name was not found
    #[error("Audio device '{0}' not found")]
    DeviceNotFound(String),

    /// No stereo f32 configuration at the requested rate
    #[error("No supported stereo output config at {rate} Hz on '{device}'")]
    NoSupportedConfig { device: String, rate: u32 },

    /// Backend failure (enumeration, stream build, playback start)
    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, EngineError>;
