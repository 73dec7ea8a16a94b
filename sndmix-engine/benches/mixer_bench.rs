//! Full process-cycle benchmark at maximum polyphony
//!
//! Measures one mixdown buffer (drain + dispatch + render) with all 64
//! channels looping, which is the worst case the audio callback can hit.

use criterion::{criterion_group, criterion_main, Criterion};
use sndmix_common::{Param, Timestamp};
use sndmix_engine::{Mixdown, Mixer, Sound, CHANNEL_CAPACITY};

fn bench_full_polyphony(c: &mut Criterion) {
    let mixer = Mixer::new();
    let mut mixdown = Mixdown::new_record(&mixer, 48000, 1024).unwrap();

    // A short loop per channel keeps every voice alive for the whole run.
    let sound = Sound::from_stereo(
        (0..4800 * 2).map(|i| ((i * 37) % 32768) as i16 - 16384).collect(),
        48000,
    );
    let handles: Vec<_> = (0..CHANNEL_CAPACITY)
        .map(|i| {
            let handle = mixer
                .channel_play_looping(&sound, Timestamp::ZERO)
                .expect("free channel");
            mixer.channel_set_param(&handle, Param::Volume, -(i as f32));
            mixer.channel_set_param(&handle, Param::Pan, (i as f32 / 32.0) - 1.0);
            handle
        })
        .collect();
    mixer.commit();
    // Warm-up buffer so every channel is started before measurement.
    mixdown.process(Timestamp::ZERO);

    c.bench_function("process_64_channels", |b| {
        b.iter(|| mixdown.process(Timestamp::ZERO))
    });

    drop(handles);
}

fn bench_commit_with_messages(c: &mut Criterion) {
    let mixer = Mixer::new();
    let mut mixdown = Mixdown::new_record(&mixer, 48000, 1024).unwrap();
    let sound = Sound::from_mono(vec![8192; 4800], 48000);
    let handles: Vec<_> = (0..CHANNEL_CAPACITY)
        .map(|_| mixer.channel_play_looping(&sound, Timestamp::ZERO).unwrap())
        .collect();
    mixer.commit();
    mixdown.process(Timestamp::ZERO);

    c.bench_function("commit_128_messages", |b| {
        b.iter(|| {
            for handle in &handles {
                mixer.channel_set_param(handle, Param::Volume, -6.0);
                mixer.channel_set_param(handle, Param::Pan, 0.25);
            }
            mixer.commit();
            mixdown.process(Timestamp::ZERO);
        })
    });

    drop(handles);
}

criterion_group!(benches, bench_full_polyphony, bench_commit_with_messages);
criterion_main!(benches);
