//! Per-output rendering pipeline
//!
//! A [`Mixdown`] is one output's view of the mixer: the live device callback
//! owns one, an optional file recorder owns another. Each process cycle it
//! drains its inbox under the commit lock (copying committed messages and a
//! snapshot of the channel array into purely local state), advances its time
//! map, dispatches messages whose sample offsets fall inside the buffer, and
//! renders every started channel into the left/right bus accumulators.
//!
//! Everything outside the brief inbox drain runs without any lock: the local
//! channel mirrors, the process queue, and all sample buffers belong to the
//! mixdown's thread alone.

use sndmix_common::{Timestamp, PARAM_COUNT};
use std::sync::Arc;
use tracing::{debug, trace};

use super::channel::{GlobalFlags, LocalFlags, CHANNEL_CAPACITY};
use super::control::Mixer;
use super::envelope::{lanes_to_bus_gains, param_buf_len, ParamLane, PARAM_RATE_BITS};
use super::message::MsgQueue;
use super::timemap::TimeMap;
use super::MixdownKind;
use crate::error::MixdownError;
use crate::sound::Sound;

/// Smallest and largest legal audio buffer sizes, in frames.
pub const MIN_BUFFER_SIZE: usize = 32;
pub const MAX_BUFFER_SIZE: usize = 32768;

/// One mixdown's private mirror of a channel slot.
#[derive(Debug, Default)]
struct LocalChannel {
    flags: LocalFlags,
    /// Serial of the slot occupant this mirror is bound to.
    serial: u32,
    sound: Option<Arc<Sound>>,
    /// Sample offset of the sound's first frame relative to the current
    /// buffer start. Negative once playback is under way.
    pos: i64,
    start_time: Timestamp,
    stop_time: Option<Timestamp>,
    lanes: [ParamLane; PARAM_COUNT],
    /// Committed parameter values captured when the occupant was first seen;
    /// the lanes start from these at the start sample.
    params_at_start: [f32; PARAM_COUNT],
    /// The DONE bit has been pushed to the global flags.
    done_reported: bool,
}

impl LocalChannel {
    fn reset(&mut self) {
        *self = LocalChannel::default();
    }
}

/// One output rendering pipeline (live playback or file recording).
pub struct Mixdown {
    mixer: Mixer,
    slot: usize,
    kind: MixdownKind,
    rate: u32,
    bufsize: usize,
    pbufsize: usize,
    map: TimeMap,
    /// Messages not yet consumed; survivors of previous buffers first.
    queue: MsgQueue,
    wall_time: Timestamp,
    commit_time: Timestamp,
    /// Session time base the map anchors to; None until the first commit.
    base_time: Option<Timestamp>,
    ready: bool,
    chans: Vec<LocalChannel>,
    input_l: Vec<f32>,
    input_r: Vec<f32>,
    bus_l: Vec<f32>,
    bus_r: Vec<f32>,
    /// Parameter scratch: `CHANNEL_CAPACITY * PARAM_COUNT` lanes of
    /// `pbufsize` values each.
    pbuf: Vec<f32>,
}

impl Mixdown {
    /// Create the live mixdown: drift-tracking time map, driven by the audio
    /// device callback.
    pub fn new_live(mixer: &Mixer, rate: u32, bufsize: usize) -> Result<Mixdown, MixdownError> {
        Mixdown::with_kind(mixer, MixdownKind::Live, rate, bufsize)
    }

    /// Create the record mixdown: exact time map, no drift, for rendering
    /// the command stream to a file.
    pub fn new_record(mixer: &Mixer, rate: u32, bufsize: usize) -> Result<Mixdown, MixdownError> {
        Mixdown::with_kind(mixer, MixdownKind::Record, rate, bufsize)
    }

    fn with_kind(
        mixer: &Mixer,
        kind: MixdownKind,
        rate: u32,
        bufsize: usize,
    ) -> Result<Mixdown, MixdownError> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&bufsize) || !bufsize.is_power_of_two() {
            return Err(MixdownError::InvalidBufferSize(bufsize));
        }
        if !(11025..=192000).contains(&rate) {
            return Err(MixdownError::InvalidSampleRate(rate));
        }
        let (slot, base_time) = mixer.register_mixdown(kind, rate)?;

        let map = match kind {
            MixdownKind::Live => TimeMap::new_live(rate, bufsize),
            MixdownKind::Record => TimeMap::new_offline(rate, bufsize),
        };
        let pbufsize = param_buf_len(bufsize);
        Ok(Mixdown {
            mixer: mixer.clone(),
            slot,
            kind,
            rate,
            bufsize,
            pbufsize,
            map,
            queue: MsgQueue::with_capacity(256),
            wall_time: Timestamp::ZERO,
            commit_time: Timestamp::ZERO,
            base_time,
            ready: false,
            chans: (0..CHANNEL_CAPACITY).map(|_| LocalChannel::default()).collect(),
            input_l: vec![0.0; bufsize],
            input_r: vec![0.0; bufsize],
            bus_l: vec![0.0; bufsize],
            bus_r: vec![0.0; bufsize],
            pbuf: vec![0.0; CHANNEL_CAPACITY * PARAM_COUNT * pbufsize],
        })
    }

    pub fn kind(&self) -> MixdownKind {
        self.kind
    }

    pub fn sample_rate(&self) -> u32 {
        self.rate
    }

    pub fn buffer_size(&self) -> usize {
        self.bufsize
    }

    /// The client timestamp the time map associates with the end of the
    /// buffer most recently rendered.
    pub fn timestamp(&self) -> Timestamp {
        self.map.buffer_end_time()
    }

    /// Render one buffer. `end_time` is the caller's wall-clock estimate for
    /// the end of this buffer; the map itself is driven by commit times, so
    /// the estimate is only used for drift diagnostics.
    ///
    /// Returns the number of frames rendered (always the buffer size).
    pub fn process(&mut self, end_time: Timestamp) -> usize {
        if !self.drain_inbox() {
            // No commit yet: no time base to map against. Render silence.
            self.bus_l.fill(0.0);
            self.bus_r.fill(0.0);
            return self.bufsize;
        }
        if let Some(base) = self.base_time {
            self.map.prime(base);
        }
        self.map.advance(self.wall_time, self.commit_time);
        trace!(
            kind = ?self.kind,
            drift_ms = end_time.delta(self.map.buffer_end_time()),
            queued = self.queue.len(),
            "process"
        );
        self.queue.sort_by_addr();
        self.dispatch_and_render();
        self.bufsize
    }

    /// Interleave the bus accumulators into `out` (stereo f32 frames).
    ///
    /// `out` must hold `2 * buffer_size` samples.
    pub fn output_f32(&self, out: &mut [f32]) {
        let frames = (out.len() / 2).min(self.bufsize);
        for i in 0..frames {
            out[i * 2] = self.bus_l[i];
            out[i * 2 + 1] = self.bus_r[i];
        }
    }

    /// Planar access to the rendered buses. Handy for encoders and tests.
    pub fn buses(&self) -> (&[f32], &[f32]) {
        (&self.bus_l, &self.bus_r)
    }

    /// Number of messages waiting for a future buffer.
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    /// True once a commit has established the session time base.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Copy committed state into local mirrors under the commit lock.
    ///
    /// This is the only lock the audio thread ever takes, and it covers a
    /// bounded amount of copying: the inbox batch plus one pass over the
    /// channel array. Returns false until the first commit has happened.
    fn drain_inbox(&mut self) -> bool {
        let mut guard = self.mixer.shared().lock();
        let state = &mut *guard;

        for (index, local) in self.chans.iter_mut().enumerate() {
            let slot = &mut state.channels[index];

            // Push our DONE bit up before anything else so this commit (or
            // the next) can reclaim the slot.
            if local.flags.contains(LocalFlags::DONE) && !local.done_reported {
                if !slot.is_free() && slot.serial == local.serial {
                    slot.global |= GlobalFlags::done_bit(self.kind);
                }
                local.done_reported = true;
            }

            if slot.is_free() {
                if !local.flags.is_empty() {
                    local.reset();
                }
                continue;
            }
            if !slot.global.contains(GlobalFlags::START) {
                // Allocated but not yet committed; not ours to touch. Clear
                // a leftover mirror of the slot's previous occupant.
                if !local.flags.is_empty() && local.serial != slot.serial {
                    local.reset();
                }
                continue;
            }

            if local.flags.is_empty() || local.serial != slot.serial {
                // First sighting of this occupant.
                local.reset();
                local.flags = LocalFlags::INIT;
                local.serial = slot.serial;
                local.sound = slot.sound.clone();
                local.start_time = slot.start_time;
                local.params_at_start = slot.committed_params;
            }

            if slot.global.contains(GlobalFlags::STOP) && local.stop_time.is_none() {
                local.stop_time = Some(slot.stop_time);
            }
            local
                .flags
                .set(LocalFlags::LOOP, slot.global.contains(GlobalFlags::LOOP));
            local.flags.set(
                LocalFlags::DETACHED,
                slot.global.contains(GlobalFlags::DETACHED),
            );
        }

        if let Some(mix) = state.slots[self.slot].as_mut() {
            self.queue.append_from(mix.inbox.as_slice());
            mix.inbox.clear();
        }
        if self.base_time.is_none() && state.ready {
            self.base_time = Some(state.first_commit);
        }
        self.wall_time = state.committed;
        self.commit_time = state.committed;
        self.ready = state.ready;
        state.ready
    }

    /// Walk the sorted process queue channel by channel, apply or retain each
    /// message, and render every started channel into the buses.
    fn dispatch_and_render(&mut self) {
        let bufsize = self.bufsize as i64;
        let pbufsize = self.pbufsize;
        let map = &self.map;
        let chans = &mut self.chans;
        let input_l = &mut self.input_l;
        let input_r = &mut self.input_r;
        let bus_l = &mut self.bus_l;
        let bus_r = &mut self.bus_r;
        let pbuf = &mut self.pbuf;

        bus_l.fill(0.0);
        bus_r.fill(0.0);

        let mut msgs = std::mem::take(self.queue.raw());
        let total = msgs.len();
        let mut read = 0;
        let mut write = 0;

        for chan in 0..CHANNEL_CAPACITY {
            let first = read;
            while read < total && msgs[read].channel() == chan {
                read += 1;
            }
            let local = &mut chans[chan];

            if !local.flags.contains(LocalFlags::INIT) || local.flags.contains(LocalFlags::DONE) {
                if read > first {
                    debug!(
                        channel = chan,
                        count = read - first,
                        "discarding messages for inactive channel"
                    );
                }
                continue;
            }

            if !local.flags.contains(LocalFlags::STARTED) {
                let start = map.sample_for(local.start_time);
                if start >= bufsize {
                    // Deferred: keep this channel's messages for a later
                    // buffer, in order.
                    for i in first..read {
                        msgs[write] = msgs[i];
                        write += 1;
                    }
                    continue;
                }
                local.flags |= LocalFlags::STARTED;
                local.pos = start;
                for (lane, initial) in local.lanes.iter_mut().zip(local.params_at_start) {
                    *lane = ParamLane::new(initial);
                }
            }

            let stop_sample = local.stop_time.and_then(|stop| {
                let s = map.sample_for(stop);
                (s < bufsize).then(|| s.max(0))
            });

            // Parameter messages, in order; future ones survive.
            let pbase = chan * PARAM_COUNT * pbufsize;
            for i in first..read {
                let msg = msgs[i];
                let sample = map.sample_for(msg.time);
                if sample >= bufsize {
                    msgs[write] = msg;
                    write += 1;
                    continue;
                }
                let lane = msg.lane();
                if lane >= PARAM_COUNT {
                    continue;
                }
                let lane_buf = &mut pbuf[pbase + lane * pbufsize..pbase + (lane + 1) * pbufsize];
                local.lanes[lane].apply(lane_buf, bufsize, sample, msg.value);
            }

            for (p, lane) in local.lanes.iter_mut().enumerate() {
                let lane_buf = &mut pbuf[pbase + p * pbufsize..pbase + (p + 1) * pbufsize];
                lane.finish(lane_buf, bufsize);
            }
            let (vol, pan) = pbuf[pbase..pbase + 2 * pbufsize].split_at_mut(pbufsize);
            lanes_to_bus_gains(vol, pan);

            render_channel(
                local, vol, pan, input_l, input_r, bus_l, bus_r, bufsize, pbufsize, stop_sample,
            );
        }

        msgs.truncate(write);
        *self.queue.raw() = msgs;
    }
}

impl Drop for Mixdown {
    fn drop(&mut self) {
        self.mixer.unregister_mixdown(self.slot);
    }
}

/// Fetch one channel's source samples and accumulate them into the buses.
#[allow(clippy::too_many_arguments)]
fn render_channel(
    local: &mut LocalChannel,
    gain_l: &[f32],
    gain_r: &[f32],
    input_l: &mut [f32],
    input_r: &mut [f32],
    bus_l: &mut [f32],
    bus_r: &mut [f32],
    bufsize: i64,
    pbufsize: usize,
    stop_sample: Option<i64>,
) {
    const SCALE: f32 = 1.0 / 32768.0;

    let Some(sound) = local.sound.clone() else {
        local.flags |= LocalFlags::DONE;
        return;
    };
    let frames = sound.frames() as i64;
    let looping = local.flags.contains(LocalFlags::LOOP);
    let pos = local.pos;

    let begin = pos.max(0).min(bufsize) as usize;
    let mut end = stop_sample.unwrap_or(bufsize).min(bufsize);
    if !looping {
        end = end.min(pos + frames);
    }
    let end = end.max(begin as i64) as usize;

    // Fill the input scratch: source samples inside [begin, end), silence
    // outside.
    input_l[..begin].fill(0.0);
    input_r[..begin].fill(0.0);
    let data = sound.samples();
    if sound.is_stereo() {
        for i in begin..end {
            let src = source_frame(i as i64 - pos, frames, looping);
            input_l[i] = data[src * 2] as f32 * SCALE;
            input_r[i] = data[src * 2 + 1] as f32 * SCALE;
        }
    } else {
        for i in begin..end {
            let src = source_frame(i as i64 - pos, frames, looping);
            let x = data[src] as f32 * SCALE;
            input_l[i] = x;
            input_r[i] = x;
        }
    }
    input_l[end..].fill(0.0);
    input_r[end..].fill(0.0);

    // Sum into the buses; the gain lanes run at the parameter rate.
    for i in 0..bufsize as usize {
        let p = (i >> PARAM_RATE_BITS).min(pbufsize - 1);
        bus_l[i] += input_l[i] * gain_l[p];
        bus_r[i] += input_r[i] * gain_r[p];
    }

    // Advance into the next buffer's frame of reference.
    local.pos -= bufsize;
    if looping {
        while local.pos <= -frames {
            local.pos += frames;
        }
    }

    let exhausted = !looping && local.pos + frames <= 0;
    if stop_sample.is_some() || exhausted {
        if stop_sample.is_some() {
            local.flags |= LocalFlags::STOPPED;
        }
        local.flags |= LocalFlags::DONE;
        local.sound = None;
    }
}

/// Source frame index for buffer-relative offset `off` (non-negative).
fn source_frame(off: i64, frames: i64, looping: bool) -> usize {
    if looping {
        (off % frames) as usize
    } else {
        off as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sndmix_common::Param;

    fn mono_const(value: i16, frames: usize) -> Arc<Sound> {
        Sound::from_mono(vec![value; frames], 48000)
    }

    /// Record mixdowns give exact, drift-free mapping, which makes them the
    /// right instrument for unit-testing the pipeline.
    fn record_setup(bufsize: usize) -> (Mixer, Mixdown) {
        let mixer = Mixer::new();
        let mixdown = Mixdown::new_record(&mixer, 48000, bufsize).unwrap();
        (mixer, mixdown)
    }

    #[test]
    fn rejects_bad_buffer_sizes() {
        let mixer = Mixer::new();
        for bad in [0usize, 16, 31, 1000, 65536] {
            assert!(matches!(
                Mixdown::new_live(&mixer, 48000, bad),
                Err(MixdownError::InvalidBufferSize(_))
            ));
        }
    }

    #[test]
    fn rejects_bad_rates() {
        let mixer = Mixer::new();
        assert!(matches!(
            Mixdown::new_live(&mixer, 8000, 1024),
            Err(MixdownError::InvalidSampleRate(8000))
        ));
        assert!(matches!(
            Mixdown::new_live(&mixer, 400_000, 1024),
            Err(MixdownError::InvalidSampleRate(_))
        ));
    }

    #[test]
    fn drop_releases_the_slot() {
        let mixer = Mixer::new();
        let mixdown = Mixdown::new_live(&mixer, 48000, 1024).unwrap();
        drop(mixdown);
        // Same kind can be created again.
        let _again = Mixdown::new_live(&mixer, 48000, 1024).unwrap();
    }

    #[test]
    fn silence_until_first_commit() {
        let (_mixer, mut mixdown) = record_setup(1024);
        let frames = mixdown.process(Timestamp::ZERO);
        assert_eq!(frames, 1024);
        let (l, r) = mixdown.buses();
        assert!(l.iter().all(|&x| x == 0.0));
        assert!(r.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn plays_a_committed_sound_at_unity_center() {
        let (mixer, mut mixdown) = record_setup(1024);
        let sound = mono_const(16384, 48000); // 0.5 amplitude, 1 s
        let _ch = mixer.channel_play(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();
        mixdown.process(Timestamp::from_millis(21));

        let (l, r) = mixdown.buses();
        let expected = 0.5 * std::f32::consts::FRAC_1_SQRT_2;
        for i in 0..1024 {
            assert!((l[i] - expected).abs() < 1e-4, "left sample {}: {}", i, l[i]);
            assert!((r[i] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn interleaved_output_matches_buses() {
        let (mixer, mut mixdown) = record_setup(256);
        let sound = Sound::from_stereo(
            (0..256 * 2)
                .map(|i| if i % 2 == 0 { 16384 } else { -16384 })
                .collect(),
            48000,
        );
        let _ch = mixer.channel_play(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();
        mixdown.process(Timestamp::ZERO);

        let mut out = vec![0.0f32; 512];
        mixdown.output_f32(&mut out);
        let (l, r) = mixdown.buses();
        for i in 0..256 {
            assert_eq!(out[i * 2], l[i]);
            assert_eq!(out[i * 2 + 1], r[i]);
        }
        assert!(l[0] > 0.0 && r[0] < 0.0);
    }

    #[test]
    fn sound_end_marks_channel_done_and_frees_slot() {
        let (mixer, mut mixdown) = record_setup(1024);
        let sound = mono_const(8000, 512); // shorter than one buffer
        let ch = mixer.channel_play(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();
        mixdown.process(Timestamp::ZERO);

        let (l, _) = mixdown.buses();
        assert!(l[0] != 0.0);
        assert_eq!(l[512], 0.0);

        // DONE propagates at the next drain; the commit after that reclaims.
        mixdown.process(Timestamp::ZERO);
        mixer.commit();
        assert!(mixer.channel_is_done(&ch));
        assert_eq!(std::sync::Arc::strong_count(&sound), 1);
    }

    #[test]
    fn looping_channel_wraps_instead_of_ending() {
        let (mixer, mut mixdown) = record_setup(1024);
        // 100-frame loop of a recognizable step pattern.
        let samples: Vec<i16> = (0..100).map(|i| if i < 50 { 16384 } else { -16384 }).collect();
        let sound = Sound::from_mono(samples, 48000);
        let ch = mixer.channel_play_looping(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();

        for _ in 0..5 {
            mixdown.process(Timestamp::ZERO);
            let (l, _) = mixdown.buses();
            // Still producing signal the whole buffer through.
            assert!(l[0] != 0.0);
            assert!(l[1023] != 0.0);
        }
        assert!(!mixer.channel_is_done(&ch));

        // Clearing the loop lets the pass finish.
        mixer.channel_stop_loop(&ch);
        mixer.commit();
        mixdown.process(Timestamp::ZERO);
        mixdown.process(Timestamp::ZERO);
        mixer.commit();
        assert!(mixer.channel_is_done(&ch));
    }

    #[test]
    fn future_messages_survive_buffers_until_due() {
        let (mixer, mut mixdown) = record_setup(1024);
        let sound = mono_const(16384, 48000);
        let ch = mixer.channel_play(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();
        // One buffer is 21.33 ms; aim 100 ms out.
        mixer.channel_set_param_at(&ch, Param::Volume, Timestamp::from_millis(100), -80.0);
        mixer.commit();

        for _ in 0..4 {
            mixdown.process(Timestamp::ZERO);
            assert_eq!(mixdown.pending_messages(), 1);
        }
        // Fifth buffer covers 85..107 ms: the message lands.
        mixdown.process(Timestamp::ZERO);
        assert_eq!(mixdown.pending_messages(), 0);
    }

    #[test]
    fn messages_for_finished_channels_are_discarded() {
        let (mixer, mut mixdown) = record_setup(1024);
        let sound = mono_const(16384, 48000);
        let ch = mixer.channel_play(&sound, Timestamp::ZERO).unwrap();
        mixer.commit();
        mixdown.process(Timestamp::ZERO); // channel starts

        // Queue a far-future change together with an immediate stop: the
        // stop finishes the channel while the change is still deferred.
        mixer.channel_set_param_at(&ch, Param::Volume, Timestamp::from_millis(500), -6.0);
        mixer.channel_stop(&ch);
        mixer.commit();

        mixdown.process(Timestamp::ZERO); // stop applied, message retained
        assert_eq!(mixdown.pending_messages(), 1);
        mixdown.process(Timestamp::ZERO); // channel done: message discarded
        assert_eq!(mixdown.pending_messages(), 0);
    }

    #[test]
    fn deferred_start_retains_channel_messages() {
        let (mixer, mut mixdown) = record_setup(1024);
        let sound = mono_const(16384, 48000);
        // Start one second out.
        let ch = mixer
            .channel_play(&sound, Timestamp::from_millis(1000))
            .unwrap();
        mixer.commit();
        mixer.channel_set_param(&ch, Param::Pan, -1.0);
        mixer.commit();

        mixdown.process(Timestamp::ZERO);
        let (l, _) = mixdown.buses();
        assert!(l.iter().all(|&x| x == 0.0));
        // The pan message rides along until the channel starts.
        assert_eq!(mixdown.pending_messages(), 1);
    }
}
