//! Rendering the command stream to a WAV file
//!
//! A [`Recorder`] owns the record mixdown and a WAV writer. The record
//! mixdown consumes the same committed command stream as the live one but
//! maps time exactly — no drift tracking — so the rendered file lines up
//! sample-for-sample with the client's timestamps.
//!
//! Pacing is the caller's job: [`Recorder::render_until`] renders whole
//! buffers up to a target time and assumes everything before that time has
//! been committed. Rendering past the committed horizon does not block, it
//! just renders the events that exist.

use crate::error::Result;
use crate::mixer::{Mixdown, Mixer};
use sndmix_common::Timestamp;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info, warn};

/// Offline mixdown driving a 16-bit stereo WAV writer.
pub struct Recorder {
    mixdown: Mixdown,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    interleaved: Vec<f32>,
    frames_written: u64,
}

impl Recorder {
    /// Create the record mixdown and open the output file.
    pub fn create(
        mixer: &Mixer,
        path: impl AsRef<Path>,
        rate: u32,
        bufsize: usize,
    ) -> Result<Recorder> {
        let mixdown = Mixdown::new_record(mixer, rate, bufsize)?;
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;
        info!(path = %path.as_ref().display(), rate, bufsize, "recording started");
        Ok(Recorder {
            mixdown,
            writer: Some(writer),
            interleaved: vec![0.0; bufsize * 2],
            frames_written: 0,
        })
    }

    /// Render whole buffers until the mixdown's clock reaches `target`.
    ///
    /// Returns the total number of frames written so far. Does nothing until
    /// the first commit has established a time base.
    pub fn render_until(&mut self, target: Timestamp) -> Result<u64> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(self.frames_written);
        };
        while self.mixdown.timestamp().is_before(target) {
            self.mixdown.process(target);
            if !self.mixdown.is_ready() {
                debug!("recorder waiting for first commit");
                break;
            }
            self.mixdown.output_f32(&mut self.interleaved);
            for &sample in &self.interleaved {
                let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                writer.write_sample(value)?;
            }
            self.frames_written += self.mixdown.buffer_size() as u64;
        }
        Ok(self.frames_written)
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Finish the file and flush the header.
    pub fn finalize(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        info!(frames = self.frames_written, "recording finalized");
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("failed to finalize recording: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sound::Sound;

    #[test]
    fn records_committed_audio_to_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mixer = Mixer::new();
        let mut recorder = Recorder::create(&mixer, &path, 48000, 1024).unwrap();

        // Half a second of half-amplitude mono.
        let sound = Sound::from_mono(vec![16384; 24000], 48000);
        let _ch = mixer.channel_play(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();
        mixer.set_time(Timestamp::from_millis(600));
        mixer.commit();

        let frames = recorder.render_until(Timestamp::from_millis(600)).unwrap();
        assert!(frames >= 24000, "rendered only {} frames", frames);
        recorder.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48000);

        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        // Equal-power center pan: 0.5 * sqrt(1/2) of full scale.
        let expected = (0.5 * std::f32::consts::FRAC_1_SQRT_2 * 32767.0) as i16;
        assert!((samples[0] - expected).abs() <= 1);
        assert!((samples[1] - expected).abs() <= 1);
        // Past the end of the sound: silence.
        let tail = samples[2 * 25000];
        assert_eq!(tail, 0);
    }

    #[test]
    fn render_until_is_a_no_op_before_first_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        let mixer = Mixer::new();
        let mut recorder = Recorder::create(&mixer, &path, 48000, 1024).unwrap();
        let frames = recorder.render_until(Timestamp::from_millis(100)).unwrap();
        assert_eq!(frames, 0);
        recorder.finalize().unwrap();
    }
}
