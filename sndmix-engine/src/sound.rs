//! Decoded sounds and the WAV provider
//!
//! A [`Sound`] is an immutable block of 16-bit PCM the mixer reads from while
//! rendering. Sounds are shared by `Arc`: the control layer and every mixdown
//! hold their own strong reference, so a sound stays alive exactly as long as
//! some channel can still read it, and the final drop may run on any thread.
//!
//! Sounds are not resampled here. The mixer assumes the provider delivers
//! audio at the mixer rate; loading a file at a different rate is allowed for
//! diagnostics and tests but logs a warning.

use crate::error::SoundError;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// An immutable, reference-counted block of decoded PCM.
///
/// Samples are interleaved when stereo. The sample array length is
/// `frames * channels`.
#[derive(Debug)]
pub struct Sound {
    samples: Vec<i16>,
    stereo: bool,
    frames: usize,
    sample_rate: u32,
    path: String,
}

impl Sound {
    /// Load a WAV file.
    ///
    /// Accepts mono or stereo, 16-bit integer or 32-bit float samples
    /// (floats are converted to i16). Anything else is an error — the
    /// provider's contract is "already decoded, already at mixer rate",
    /// not "general-purpose codec".
    pub fn load_wav(path: impl AsRef<Path>, mixer_rate: u32) -> Result<Arc<Sound>, SoundError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.channels == 0 || spec.channels > 2 {
            return Err(SoundError::BadChannelCount {
                channels: spec.channels,
                path: path_str,
            });
        }

        let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => {
                reader.samples::<i16>().collect::<Result<_, _>>()?
            }
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|x| (x.clamp(-1.0, 1.0) * 32767.0) as i16))
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(SoundError::UnsupportedFormat {
                    bits,
                    format: match format {
                        hound::SampleFormat::Int => "int",
                        hound::SampleFormat::Float => "float",
                    },
                    path: path_str,
                });
            }
        };

        let stereo = spec.channels == 2;
        let frames = samples.len() / spec.channels as usize;
        if frames == 0 {
            return Err(SoundError::Empty { path: path_str });
        }

        if spec.sample_rate != mixer_rate {
            warn!(
                path = %path_str,
                file_rate = spec.sample_rate,
                mixer_rate,
                "sound rate differs from mixer rate; it will play detuned"
            );
        }
        debug!(path = %path_str, frames, stereo, rate = spec.sample_rate, "loaded sound");

        Ok(Arc::new(Sound {
            samples,
            stereo,
            frames,
            sample_rate: spec.sample_rate,
            path: path_str,
        }))
    }

    /// Build a mono sound from raw frames. Used by tests and tools.
    pub fn from_mono(samples: Vec<i16>, sample_rate: u32) -> Arc<Sound> {
        let frames = samples.len();
        Arc::new(Sound {
            samples,
            stereo: false,
            frames,
            sample_rate,
            path: "<mono>".to_string(),
        })
    }

    /// Build a stereo sound from interleaved frames. Used by tests and tools.
    pub fn from_stereo(interleaved: Vec<i16>, sample_rate: u32) -> Arc<Sound> {
        let frames = interleaved.len() / 2;
        Arc::new(Sound {
            samples: interleaved,
            stereo: true,
            frames,
            sample_rate,
            path: "<stereo>".to_string(),
        })
    }

    /// Interleaved sample data.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// True if the sound is stereo (interleaved).
    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Sample rate the sound was produced at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Origin path, for diagnostics.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Play length in milliseconds at the sound's own rate.
    pub fn duration_ms(&self) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        ((self.frames as u64 * 1000) / self.sample_rate as u64) as u32
    }
}
