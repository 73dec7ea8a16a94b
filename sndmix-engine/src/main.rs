//! # sndmix demo player
//!
//! Plays WAV files through the live mixer, or renders the same command
//! stream to a file with the record mixdown. Mostly useful for hearing the
//! engine and for eyeballing latency/drift logs.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sndmix_common::{Timestamp, WallClock};
use sndmix_engine::{AudioOutput, Config, Mixer, Recorder, Sound};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sndmix")]
#[command(about = "Game audio mixer - demo player")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sndmix.toml")]
    config: PathBuf,

    /// Sample rate (overrides config file)
    #[arg(short, long)]
    rate: Option<u32>,

    /// Buffer size in frames (overrides config file)
    #[arg(short, long)]
    bufsize: Option<usize>,

    /// Output device name substring (overrides config file)
    #[arg(short, long)]
    device: Option<String>,

    /// Render to this WAV file instead of playing live
    #[arg(long)]
    record: Option<PathBuf>,

    /// Milliseconds between successive sound starts
    #[arg(long, default_value_t = 250)]
    spacing: u32,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// WAV files to play
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sndmix=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in AudioOutput::list_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }
    if args.files.is_empty() {
        bail!("no input files (try --help)");
    }

    let config = Config::load(
        Some(&args.config),
        args.rate,
        args.bufsize,
        args.device.clone(),
    )?;
    info!(
        rate = config.audio.rate,
        bufsize = config.audio.bufsize,
        "mixer configuration"
    );

    let sounds: Vec<Arc<Sound>> = args
        .files
        .iter()
        .map(|path| {
            Sound::load_wav(path, config.audio.rate)
                .with_context(|| format!("loading {}", path.display()))
        })
        .collect::<Result<_>>()?;

    let mixer = Mixer::new();
    match args.record {
        Some(path) => record(&mixer, &config, &sounds, args.spacing, &path),
        None => play(&mixer, &config, &sounds, args.spacing),
    }
}

/// Live playback: schedule every sound up front, then tick the client loop
/// (set_time + commit) until all channels report done.
fn play(mixer: &Mixer, config: &Config, sounds: &[Arc<Sound>], spacing: u32) -> Result<()> {
    let clock = WallClock::new();
    let output = AudioOutput::start(mixer, &config.audio, &clock)?;
    info!(device = output.device_name(), "playing live");

    let start = clock.now().offset(100);
    mixer.set_time(clock.now());
    let handles: Vec<_> = sounds
        .iter()
        .enumerate()
        .filter_map(|(i, sound)| {
            let at = start.offset((i as u32 * spacing) as i32);
            mixer.channel_play(sound, at)
        })
        .collect();
    if handles.len() < sounds.len() {
        info!(
            dropped = sounds.len() - handles.len(),
            "some sounds did not get a channel"
        );
    }
    mixer.commit();

    // The client loop: advance wall time and publish, like a game frame.
    loop {
        std::thread::sleep(Duration::from_millis(10));
        mixer.set_time(clock.now());
        mixer.commit();
        if handles.iter().all(|h| mixer.channel_is_done(h)) {
            break;
        }
    }
    // Let the tail of the last buffer drain before tearing the stream down.
    std::thread::sleep(Duration::from_millis(100));
    Ok(())
}

/// Offline render: same command stream, exact time map, straight to WAV.
fn record(
    mixer: &Mixer,
    config: &Config,
    sounds: &[Arc<Sound>],
    spacing: u32,
    path: &PathBuf,
) -> Result<()> {
    let mut recorder = Recorder::create(mixer, path, config.audio.rate, config.audio.bufsize)?;

    mixer.set_time(Timestamp::ZERO);
    let mut end_ms: u32 = 0;
    let handles: Vec<_> = sounds
        .iter()
        .enumerate()
        .filter_map(|(i, sound)| {
            let at = i as u32 * spacing;
            end_ms = end_ms.max(at + sound.duration_ms());
            mixer.channel_play(sound, Timestamp::from_millis(at))
        })
        .collect();
    mixer.commit();

    // Commit the full timeline, then render it.
    let end = Timestamp::from_millis(end_ms + 100);
    mixer.set_time(end);
    mixer.commit();
    let frames = recorder.render_until(end)?;
    mixer.commit(); // reap finished channels
    recorder.finalize()?;

    info!(
        path = %path.display(),
        frames,
        channels = handles.len(),
        "render complete"
    );
    Ok(())
}
