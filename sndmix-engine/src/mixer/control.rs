//! Client-facing control layer and the commit boundary
//!
//! [`Mixer`] owns all shared mixer state behind one mutex — the commit lock.
//! Control calls (play, stop, parameter changes) flip channel flags and append
//! to the uncommitted queue under that lock; none of them blocks beyond the
//! lock itself, and the lock is never held across I/O or unbounded work.
//!
//! Nothing a control call does is visible to the audio threads until
//! [`Mixer::commit`] runs. Commit synchronizes channel global flags from the
//! control flags, copies the uncommitted queue into every active mixdown's
//! inbox, snapshots committed parameter values, advances the commit
//! timestamp, and reclaims channels every active mixdown has finished with.
//!
//! # Example
//!
//! ```no_run
//! use sndmix_engine::{Mixer, Sound};
//! use sndmix_common::{Param, Timestamp};
//!
//! let mixer = Mixer::new();
//! let sound = Sound::from_mono(vec![0; 48000], 48000);
//!
//! mixer.set_time(Timestamp::from_millis(0));
//! if let Some(channel) = mixer.channel_play(&sound, Timestamp::from_millis(10)) {
//!     mixer.channel_set_param(&channel, Param::Volume, -6.0);
//!     mixer.commit();
//! }
//! ```

use crate::sound::Sound;
use sndmix_common::{Param, Timestamp};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::channel::{ChannelSlot, ControlFlags, GlobalFlags, CHANNEL_CAPACITY};
use super::message::{MsgQueue, ParamMsg};
use super::MixdownKind;
use crate::error::MixdownError;

/// At most one live and one record mixdown.
pub(crate) const MIXDOWN_CAPACITY: usize = 2;

/// Registration record for one active mixdown.
pub(crate) struct MixdownSlot {
    pub kind: MixdownKind,
    /// Committed messages waiting to be drained by the mixdown thread.
    pub inbox: MsgQueue,
}

/// Everything behind the commit lock.
pub(crate) struct MixerState {
    pub channels: Vec<ChannelSlot>,
    /// Control calls append here; commit moves the batch into the inboxes.
    pub pending: MsgQueue,
    /// Current uncommitted timestamp, advanced by `set_time`.
    pub now: Timestamp,
    /// Timestamp of the most recent commit.
    pub committed: Timestamp,
    /// Timestamp of the very first commit — the session's time-base origin,
    /// which the record mixdown anchors its exact map to.
    pub first_commit: Timestamp,
    /// True once the first commit has established a time base.
    pub ready: bool,
    /// Sample rate shared by all active mixdowns; 0 while none exist.
    pub sample_rate: u32,
    pub slots: [Option<MixdownSlot>; MIXDOWN_CAPACITY],
}

pub(crate) struct MixerShared {
    state: Mutex<MixerState>,
}

impl MixerShared {
    /// Take the commit lock. Poisoning means a thread panicked mid-update —
    /// an internal bug; propagating the panic is the only safe option.
    pub fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().expect("mixer state lock poisoned")
    }

    fn detach(&self, index: usize, serial: u32) {
        // Runs from ChannelHandle::drop; swallow poisoning rather than
        // double-panic during unwinding.
        if let Ok(mut state) = self.state.lock() {
            let slot = &mut state.channels[index];
            if slot.serial == serial && !slot.is_free() {
                slot.control |= ControlFlags::DETACH;
            }
        }
    }
}

/// Handle to a playing (or scheduled) channel.
///
/// Dropping the handle detaches the channel: the sound plays out and the slot
/// is reclaimed once every mixdown is done with it.
pub struct ChannelHandle {
    shared: Arc<MixerShared>,
    index: usize,
    serial: u32,
}

impl ChannelHandle {
    /// Slot index, for diagnostics.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shared.detach(self.index, self.serial);
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("index", &self.index)
            .field("serial", &self.serial)
            .finish()
    }
}

/// The mixer: channel control layer plus commit boundary.
///
/// Cheap to clone; clones share the same state. All methods are safe to call
/// from any thread.
#[derive(Clone)]
pub struct Mixer {
    shared: Arc<MixerShared>,
}

impl Mixer {
    pub fn new() -> Mixer {
        let channels = (0..CHANNEL_CAPACITY).map(|_| ChannelSlot::default()).collect();
        Mixer {
            shared: Arc::new(MixerShared {
                state: Mutex::new(MixerState {
                    channels,
                    pending: MsgQueue::with_capacity(256),
                    now: Timestamp::ZERO,
                    committed: Timestamp::ZERO,
                    first_commit: Timestamp::ZERO,
                    ready: false,
                    sample_rate: 0,
                    slots: [None, None],
                }),
            }),
        }
    }

    /// Advance the uncommitted timestamp. All subsequent control calls use
    /// this time until the next `set_time`.
    pub fn set_time(&self, now: Timestamp) {
        self.shared.lock().now = now;
    }

    /// The current uncommitted timestamp.
    pub fn time(&self) -> Timestamp {
        self.shared.lock().now
    }

    /// Schedule `sound` to start playing at `time`. Returns None when every
    /// channel is busy — voice stealing is the caller's policy, not ours.
    pub fn channel_play(&self, sound: &Arc<Sound>, time: Timestamp) -> Option<ChannelHandle> {
        self.play_impl(sound, time, false)
    }

    /// Like [`Mixer::channel_play`], but the sound repeats until
    /// [`Mixer::channel_stop_loop`] or [`Mixer::channel_stop`].
    pub fn channel_play_looping(
        &self,
        sound: &Arc<Sound>,
        time: Timestamp,
    ) -> Option<ChannelHandle> {
        self.play_impl(sound, time, true)
    }

    fn play_impl(
        &self,
        sound: &Arc<Sound>,
        time: Timestamp,
        looping: bool,
    ) -> Option<ChannelHandle> {
        let mut state = self.shared.lock();
        let time = time.clip(state.now);
        let index = state.channels.iter().position(|slot| slot.is_free());
        let Some(index) = index else {
            warn!(sound = sound.path(), "no free channel, dropping play request");
            return None;
        };
        let slot = &mut state.channels[index];
        slot.allocate(Arc::clone(sound), time, looping);
        debug!(channel = index, sound = sound.path(), time = %time, "channel allocated");
        Some(ChannelHandle {
            shared: Arc::clone(&self.shared),
            index,
            serial: slot.serial,
        })
    }

    /// Stop the channel at the current uncommitted timestamp.
    pub fn channel_stop(&self, handle: &ChannelHandle) {
        let mut state = self.shared.lock();
        let now = state.now;
        if let Some(slot) = valid_slot(&mut state, handle, "stop") {
            slot.control |= ControlFlags::STOP;
            slot.stop_time = now;
        }
    }

    /// Clear the loop flag; the current pass plays to its natural end.
    pub fn channel_stop_loop(&self, handle: &ChannelHandle) {
        let mut state = self.shared.lock();
        if let Some(slot) = valid_slot(&mut state, handle, "stop_loop") {
            slot.control.remove(ControlFlags::LOOP);
        }
    }

    /// Set a parameter at the current uncommitted timestamp.
    ///
    /// Before the channel's first commit this writes the initial parameter
    /// block directly; afterwards it becomes a queued message.
    pub fn channel_set_param(&self, handle: &ChannelHandle, param: Param, value: f32) {
        let mut state = self.shared.lock();
        let now = state.now;
        self.set_param_locked(&mut state, handle, param, now, value);
    }

    /// Set a parameter at an explicit timestamp — the primitive behind
    /// two-message linear ramps.
    pub fn channel_set_param_at(
        &self,
        handle: &ChannelHandle,
        param: Param,
        time: Timestamp,
        value: f32,
    ) {
        let mut state = self.shared.lock();
        self.set_param_locked(&mut state, handle, param, time, value);
    }

    /// Batch parameter set at the current uncommitted timestamp.
    pub fn channel_set_params(&self, handle: &ChannelHandle, values: &[(Param, f32)]) {
        let mut state = self.shared.lock();
        let now = state.now;
        for &(param, value) in values {
            self.set_param_locked(&mut state, handle, param, now, value);
        }
    }

    fn set_param_locked(
        &self,
        state: &mut MixerState,
        handle: &ChannelHandle,
        param: Param,
        time: Timestamp,
        value: f32,
    ) {
        // Committed messages must not predate the last commit.
        let time = time.clip(state.now).latest(state.committed);
        let value = param.clamp(value);
        let queue_message = match valid_slot(state, handle, "set_param") {
            // Still in the INIT window: write the initial block directly.
            Some(slot) if slot.control.contains(ControlFlags::INIT) => {
                slot.initial_params[param.index()] = value;
                false
            }
            Some(_) => true,
            None => false,
        };
        if queue_message {
            state
                .pending
                .push(ParamMsg::new(handle.index, param, time, value));
        }
    }

    /// True once every active mixdown has finished with the channel (or the
    /// slot has already been reclaimed).
    pub fn channel_is_done(&self, handle: &ChannelHandle) -> bool {
        let state = self.shared.lock();
        let slot = &state.channels[handle.index];
        slot.serial != handle.serial || slot.is_free()
    }

    /// Publish all uncommitted state to the mixdown threads.
    ///
    /// Holds the commit lock for O(channels + messages): flag sync, inbox
    /// copies, committed-parameter snapshots, commit-time advance, and
    /// reclamation of finished channels.
    pub fn commit(&self) {
        let mut state = self.shared.lock();
        let state = &mut *state;
        let now = state.now;
        state.committed = now;
        if !state.ready {
            state.first_commit = now;
            state.ready = true;
        }

        // (a) Synchronize global flags from control flags.
        for slot in &mut state.channels {
            if slot.is_free() {
                continue;
            }
            let control = slot.control;
            let mut global = slot.global;
            global.set(GlobalFlags::START, control.contains(ControlFlags::START));
            global.set(GlobalFlags::STOP, control.contains(ControlFlags::STOP));
            global.set(GlobalFlags::LOOP, control.contains(ControlFlags::LOOP));
            if control.contains(ControlFlags::DETACH) {
                global |= GlobalFlags::DETACHED;
            }
            slot.global = global;
            if control.contains(ControlFlags::INIT) {
                slot.control.remove(ControlFlags::INIT);
                slot.committed_params = slot.initial_params;
            }
        }

        // (b) Duplicate the uncommitted batch into every active inbox.
        for mix in state.slots.iter_mut().flatten() {
            mix.inbox.append_from(state.pending.as_slice());
        }

        // (c) Committed parameter snapshots follow the latest message per
        // parameter; the batch is in arrival order, so last write wins.
        for msg in state.pending.as_slice() {
            let channel = msg.channel();
            if channel < state.channels.len() && !state.channels[channel].is_free() {
                state.channels[channel].committed_params[msg.lane()] = msg.value;
            }
        }
        state.pending.clear();

        // (e) Reclaim channels every active mixdown is done with. Without any
        // mixdown, reap by time so control-only use cannot leak slots.
        let mut done_mask = GlobalFlags::empty();
        for mix in state.slots.iter().flatten() {
            done_mask |= GlobalFlags::done_bit(mix.kind);
        }
        for (index, slot) in state.channels.iter_mut().enumerate() {
            if slot.is_free() {
                continue;
            }
            let reclaim = if !done_mask.is_empty() {
                slot.global.contains(done_mask)
            } else {
                channel_expired(slot, now)
            };
            if reclaim {
                debug!(channel = index, "channel reclaimed");
                slot.release();
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<MixerShared> {
        &self.shared
    }

    /// Register a mixdown of `kind` at `rate`. All mixdowns share one rate.
    ///
    /// Returns the slot index and, if the time base is already established,
    /// the current commit time for the mixdown to anchor to. A mixdown
    /// registered before the first commit anchors to the first commit
    /// instead, discovered during its inbox drain.
    pub(crate) fn register_mixdown(
        &self,
        kind: MixdownKind,
        rate: u32,
    ) -> Result<(usize, Option<Timestamp>), MixdownError> {
        let mut state = self.shared.lock();
        if state
            .slots
            .iter()
            .flatten()
            .any(|slot| slot.kind == kind)
        {
            return Err(MixdownError::SlotOccupied(kind));
        }
        if state.sample_rate != 0 && state.sample_rate != rate {
            return Err(MixdownError::RateMismatch {
                active: state.sample_rate,
                requested: rate,
            });
        }
        let index = state
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .expect("two mixdown kinds, two slots");
        state.sample_rate = rate;
        state.slots[index] = Some(MixdownSlot {
            kind,
            inbox: MsgQueue::with_capacity(256),
        });
        debug!(?kind, rate, slot = index, "mixdown registered");
        let base = state.ready.then_some(state.committed);
        Ok((index, base))
    }

    pub(crate) fn unregister_mixdown(&self, index: usize) {
        let mut state = self.shared.lock();
        if let Some(slot) = state.slots[index].take() {
            debug!(kind = ?slot.kind, slot = index, "mixdown deregistered");
        }
        if state.slots.iter().all(|slot| slot.is_none()) {
            state.sample_rate = 0;
        }
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Mixer::new()
    }
}

/// Validate a handle against the slot's serial.
///
/// A freed slot is the natural end of a channel's life (stops on finished
/// channels are no-ops); a serial mismatch on an occupied slot means the
/// caller kept a handle across reuse, which is a caller bug worth shouting
/// about.
fn valid_slot<'a>(
    state: &'a mut MixerState,
    handle: &ChannelHandle,
    op: &'static str,
) -> Option<&'a mut ChannelSlot> {
    let slot = &mut state.channels[handle.index];
    if slot.is_free() {
        debug!(channel = handle.index, op, "operation on finished channel ignored");
        return None;
    }
    if slot.serial != handle.serial {
        error!(channel = handle.index, op, "operation on stale channel handle ignored");
        return None;
    }
    Some(slot)
}

/// With no mixdowns active, a channel is reclaimable once its scheduled
/// audio lies entirely in the past.
fn channel_expired(slot: &ChannelSlot, now: Timestamp) -> bool {
    if slot.control.contains(ControlFlags::STOP) {
        return now.delta(slot.stop_time) > 0;
    }
    if slot.control.contains(ControlFlags::LOOP) {
        return false;
    }
    match &slot.sound {
        Some(sound) => now.delta(slot.start_time) > sound.duration_ms() as i32,
        None => true,
    }
}
