//! Live mixdown driven by a simulated device thread
//!
//! No audio hardware here: the test plays the role of the device callback,
//! calling `process` at the buffer rate while a simulated client advances
//! wall time and commits. Timing assertions stay loose — the live map's job
//! is convergence, not exactness.

use sndmix_common::{Param, Timestamp};
use sndmix_engine::{Mixdown, Mixer, Sound};
use std::sync::Arc;

const RATE: u32 = 48000;
const BUFSIZE: usize = 1024;
const BUFFER_MS: u64 = BUFSIZE as u64 * 1000 / RATE as u64;

fn ts(ms: u32) -> Timestamp {
    Timestamp::from_millis(ms)
}

/// Run client commits and mixdown buffers in lockstep for `buffers` buffers,
/// collecting the peak amplitude of each rendered buffer.
fn run_lockstep(
    mixer: &Mixer,
    mixdown: &mut Mixdown,
    start_ms: u32,
    buffers: usize,
) -> Vec<f32> {
    let mut peaks = Vec::with_capacity(buffers);
    for i in 0..buffers {
        let now = ts(start_ms).offset((i as u64 * BUFFER_MS) as i32);
        mixer.set_time(now);
        mixer.commit();
        mixdown.process(now.offset(BUFFER_MS as i32));
        let (l, _) = mixdown.buses();
        peaks.push(l.iter().fold(0.0f32, |a, &b| a.max(b.abs())));
    }
    peaks
}

#[test]
fn live_playback_starts_within_startup_latency() {
    let mixer = Mixer::new();
    let mut mixdown = Mixdown::new_live(&mixer, RATE, BUFSIZE).unwrap();
    let sound = Sound::from_mono(vec![16384; RATE as usize], RATE);

    mixer.set_time(ts(1000));
    let ch = mixer.channel_play(&sound, ts(1000)).unwrap();
    mixer.commit();

    let peaks = run_lockstep(&mixer, &mut mixdown, 1000, 64);
    let first_audible = peaks.iter().position(|&p| p > 0.1);
    // The live map schedules fresh events a couple of buffers plus the
    // mixahead margin out; well under 10 buffers on a steady clock.
    let first_audible = first_audible.expect("sound never became audible");
    assert!(
        first_audible < 10,
        "audio started only at buffer {}",
        first_audible
    );
    // Once started, playback is continuous.
    assert!(peaks[first_audible..first_audible + 20]
        .iter()
        .all(|&p| p > 0.1));
    drop(ch);
}

#[test]
fn live_channel_completes_and_recycles() {
    let mixer = Mixer::new();
    let mut mixdown = Mixdown::new_live(&mixer, RATE, BUFSIZE).unwrap();
    // 100 ms sound.
    let sound = Sound::from_mono(vec![16384; 4800], RATE);

    mixer.set_time(ts(0));
    let ch = mixer.channel_play(&sound, ts(0)).unwrap();
    mixer.commit();

    let _ = run_lockstep(&mixer, &mut mixdown, 0, 40);
    assert!(mixer.channel_is_done(&ch));
    assert_eq!(Arc::strong_count(&sound), 1);
}

#[test]
fn live_parameter_change_lands() {
    let mixer = Mixer::new();
    let mut mixdown = Mixdown::new_live(&mixer, RATE, BUFSIZE).unwrap();
    let sound = Sound::from_mono(vec![16384; RATE as usize * 2], RATE);

    mixer.set_time(ts(500));
    let ch = mixer.channel_play(&sound, ts(500)).unwrap();
    mixer.commit();
    let _ = run_lockstep(&mixer, &mut mixdown, 500, 10);

    // Hard-pan right some time after start; the right bus takes over.
    mixer.channel_set_param(&ch, Param::Pan, 1.0);
    let _ = run_lockstep(&mixer, &mut mixdown, 500 + 10 * BUFFER_MS as u32, 30);
    let (l, r) = mixdown.buses();
    let left_peak = l.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
    let right_peak = r.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
    assert!(left_peak < 1e-4, "left bus still carries {}", left_peak);
    assert!(right_peak > 0.3, "right bus carries {}", right_peak);
}

#[test]
fn live_survives_a_jittery_client_clock() {
    let mixer = Mixer::new();
    let mut mixdown = Mixdown::new_live(&mixer, RATE, BUFSIZE).unwrap();
    let sound = Sound::from_mono(vec![16384; RATE as usize * 4], RATE);

    mixer.set_time(ts(0));
    let _ch = mixer.channel_play(&sound, ts(0)).unwrap();
    mixer.commit();

    // Commit times wobble +-5 ms around the ideal frame schedule.
    let mut audible_buffers = 0;
    for i in 0..150u32 {
        let jitter = [0i32, 4, -3, 5, -5, 2, -1, 3][i as usize % 8];
        let now = ts(0).offset((i as u64 * BUFFER_MS) as i32 + jitter);
        mixer.set_time(now);
        mixer.commit();
        mixdown.process(now.offset(BUFFER_MS as i32));
        let (l, _) = mixdown.buses();
        if l.iter().any(|&x| x.abs() > 0.1) {
            audible_buffers += 1;
        }
    }
    // Four seconds of sound over ~3.2 seconds of buffers with startup
    // latency: the large majority of buffers carry audio, with no dropouts
    // from jitter alone.
    assert!(
        audible_buffers > 120,
        "only {} audible buffers",
        audible_buffers
    );
}
