//! Live audio output using cpal
//!
//! Owns the device stream and the live [`Mixdown`] that feeds it. The device
//! callback renders mixer buffers into a staging buffer and copies them out
//! at whatever period the device actually uses, so the mixer's power-of-two
//! buffer size does not have to match the device period.
//!
//! The end-of-buffer timestamp handed to the mixdown is the wall clock plus
//! one mixer buffer of latency. The live time map is driven by commit times
//! and only uses this value for drift diagnostics, so the estimate being
//! rough is fine.

use crate::config::AudioConfig;
use crate::error::{DeviceError, Result};
use crate::mixer::{Mixdown, Mixer};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use sndmix_common::WallClock;
use tracing::{debug, info, warn};

/// Live audio output manager.
pub struct AudioOutput {
    stream: Option<Stream>,
    device_name: String,
    rate: u32,
    bufsize: usize,
}

impl AudioOutput {
    /// List available audio output devices.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| DeviceError::Backend(format!("failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open the output device, create the live mixdown, and start streaming.
    ///
    /// `clock` must be the same wall clock the client feeds to
    /// [`Mixer::set_time`], so the end-of-buffer estimates live in the same
    /// time base as committed events.
    pub fn start(mixer: &Mixer, config: &AudioConfig, clock: &WallClock) -> Result<AudioOutput> {
        let host = cpal::default_host();

        let device = match config.device.as_deref() {
            Some(name) => {
                let mut devices = host.output_devices().map_err(|e| {
                    DeviceError::Backend(format!("failed to enumerate devices: {}", e))
                })?;
                devices
                    .find(|d| d.name().map(|n| n.contains(name)).unwrap_or(false))
                    .ok_or_else(|| DeviceError::DeviceNotFound(name.to_string()))?
            }
            None => host.default_output_device().ok_or(DeviceError::NoDevice)?,
        };
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("using audio device: {}", device_name);

        let (stream_config, sample_format) = pick_config(&device, &device_name, config.rate)?;
        debug!(
            rate = stream_config.sample_rate.0,
            channels = stream_config.channels,
            format = ?sample_format,
            "audio config"
        );

        let mixdown = Mixdown::new_live(mixer, config.rate, config.bufsize)?;

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, mixdown, clock)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, mixdown, clock)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, mixdown, clock)?,
            other => {
                return Err(DeviceError::Backend(format!("unsupported sample format: {:?}", other))
                    .into());
            }
        };
        stream
            .play()
            .map_err(|e| DeviceError::Backend(format!("failed to start stream: {}", e)))?;
        info!("audio stream started");

        Ok(AudioOutput {
            stream: Some(stream),
            device_name,
            rate: config.rate,
            bufsize: config.bufsize,
        })
    }

    /// Stop the stream. Also happens on drop.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!("stopping audio stream");
            if let Err(e) = stream.pause() {
                warn!("failed to pause stream: {}", e);
            }
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate
    }

    pub fn buffer_size(&self) -> usize {
        self.bufsize
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find a stereo configuration supporting the requested rate, preferring f32
/// samples (our internal format).
fn pick_config(
    device: &Device,
    device_name: &str,
    rate: u32,
) -> Result<(StreamConfig, SampleFormat)> {
    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.channels() == 2 && c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate
    };

    let configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| DeviceError::Backend(format!("failed to get device configs: {}", e)))?
        .filter(supports_rate)
        .collect();

    let chosen = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
        .or_else(|| configs.first())
        .ok_or_else(|| DeviceError::NoSupportedConfig {
            device: device_name.to_string(),
            rate,
        })?;

    let sample_format = chosen.sample_format();
    let config = chosen
        .clone()
        .with_sample_rate(cpal::SampleRate(rate))
        .config();
    Ok((config, sample_format))
}

/// Build the output stream. The callback owns the mixdown outright: renders
/// a mixer buffer whenever the staging buffer runs dry and copies samples to
/// the device at its own pace.
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut mixdown: Mixdown,
    clock: &WallClock,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let clock = clock.clone();
    let bufsize = mixdown.buffer_size();
    let latency_ms = (bufsize as u64 * 1000 / mixdown.sample_rate() as u64) as i32;
    let mut staging = vec![0.0f32; bufsize * 2];
    let mut offset = staging.len();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut i = 0;
                while i < data.len() {
                    if offset == staging.len() {
                        let end_time = clock.now().offset(latency_ms);
                        mixdown.process(end_time);
                        mixdown.output_f32(&mut staging);
                        offset = 0;
                    }
                    let n = (data.len() - i).min(staging.len() - offset);
                    for k in 0..n {
                        data[i + k] = T::from_sample(staging[offset + k].clamp(-1.0, 1.0));
                    }
                    i += n;
                    offset += n;
                }
            },
            move |err| {
                warn!("audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| DeviceError::Backend(format!("failed to build stream: {}", e)))?;

    Ok(stream)
}
