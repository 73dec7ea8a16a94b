//! Configuration loading and management
//!
//! Bootstrap configuration comes from an optional TOML file; command-line
//! flags override file values, and everything has a default, so a missing
//! file is not an error.

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

use crate::mixer::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};

/// Largest buffer size the configuration accepts. Mixdowns technically go up
/// to [`MAX_BUFFER_SIZE`], but device buffers beyond this add latency with no
/// benefit.
const MAX_CONFIG_BUFSIZE: usize = 4096;

/// Raw TOML shape of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    audio: TomlAudio,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TomlAudio {
    rate: Option<u32>,
    bufsize: Option<usize>,
    device: Option<String>,
}

/// Audio section of the runtime configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Requested sample rate.
    pub rate: u32,
    /// Audio buffer size in frames; always a power of two in
    /// `[MIN_BUFFER_SIZE, 4096]`.
    pub bufsize: usize,
    /// Output device name substring, or None for the default device.
    pub device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            rate: 48000,
            bufsize: 1024,
            device: None,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub audio: AudioConfig,
}

impl Config {
    /// Load configuration from a TOML file with optional overrides.
    ///
    /// A missing file yields defaults; a malformed file is an error. The
    /// buffer size is normalized afterwards (power of two, clamped).
    pub fn load(
        config_path: Option<&Path>,
        rate_override: Option<u32>,
        bufsize_override: Option<usize>,
        device_override: Option<String>,
    ) -> Result<Config> {
        let toml_config = match config_path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str::<TomlConfig>(&text)
                    .map_err(|e| EngineError::Config(format!("failed to parse {}: {}", path.display(), e)))?
            }
            Some(path) => {
                debug!(path = %path.display(), "config file not found, using defaults");
                TomlConfig::default()
            }
            None => TomlConfig::default(),
        };

        let defaults = AudioConfig::default();
        let rate = rate_override
            .or(toml_config.audio.rate)
            .unwrap_or(defaults.rate);
        let bufsize = bufsize_override
            .or(toml_config.audio.bufsize)
            .unwrap_or(defaults.bufsize);
        let device = device_override.or(toml_config.audio.device);

        Ok(Config {
            audio: AudioConfig {
                rate,
                bufsize: normalize_bufsize(bufsize),
                device,
            },
        })
    }
}

/// Round up to a power of two and clamp to the legal window.
fn normalize_bufsize(requested: usize) -> usize {
    let normalized = requested
        .next_power_of_two()
        .clamp(MIN_BUFFER_SIZE, MAX_CONFIG_BUFSIZE);
    if normalized != requested {
        warn!(requested, normalized, "audio buffer size adjusted");
    }
    normalized
}
