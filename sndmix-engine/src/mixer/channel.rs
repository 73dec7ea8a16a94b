//! Channel slots and their flag words
//!
//! A channel is one slot in a fixed array, able to play one sound. Three flag
//! words track it through its life:
//!
//! - [`ControlFlags`] — written by client threads under the commit lock
//!   (`channel_play` sets INIT|START, `channel_stop` sets STOP, dropping the
//!   handle sets DETACH).
//! - [`GlobalFlags`] — written only by `commit`, read by every mixdown during
//!   its inbox drain. Mirrors START/STOP/LOOP and accumulates per-mixdown
//!   DONE bits.
//! - [`LocalFlags`] — private to one mixdown's local channel mirror; never
//!   shared.
//!
//! A slot with empty control flags is free. Slots recycle, so each carries a
//! serial that handles capture; an operation whose serial no longer matches
//! addresses a recycled slot and is ignored.

use crate::sound::Sound;
use bitflags::bitflags;
use sndmix_common::{Param, Timestamp, PARAM_COUNT};
use std::sync::Arc;

use super::MixdownKind;

/// Number of channel slots.
pub const CHANNEL_CAPACITY: usize = 64;

bitflags! {
    /// Client-side channel state, written under the commit lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u32 {
        /// Allocated but not yet committed; `channel_set_param` still writes
        /// the initial parameter block directly.
        const INIT   = 1 << 0;
        /// A sound is scheduled to play at `start_time`.
        const START  = 1 << 1;
        /// Playback ends at `stop_time`.
        const STOP   = 1 << 2;
        /// The sound repeats until LOOP is cleared or the channel stops.
        const LOOP   = 1 << 3;
        /// The handle is gone; reclaim the slot as soon as rendering is done.
        const DETACH = 1 << 4;
    }
}

bitflags! {
    /// Committed channel state, read by mixdowns during inbox drain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GlobalFlags: u32 {
        const START       = 1 << 0;
        const STOP        = 1 << 1;
        const LOOP        = 1 << 2;
        const DETACHED    = 1 << 3;
        /// The live mixdown has finished with this channel.
        const DONE_LIVE   = 1 << 8;
        /// The record mixdown has finished with this channel.
        const DONE_RECORD = 1 << 9;
    }
}

impl GlobalFlags {
    /// The DONE bit a mixdown of the given kind reports through.
    pub fn done_bit(kind: MixdownKind) -> GlobalFlags {
        match kind {
            MixdownKind::Live => GlobalFlags::DONE_LIVE,
            MixdownKind::Record => GlobalFlags::DONE_RECORD,
        }
    }
}

bitflags! {
    /// Per-mixdown channel state; local to one mixdown thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LocalFlags: u32 {
        /// The mirror is bound to the slot's current occupant.
        const INIT     = 1 << 0;
        /// Rendering has begun; the start sample fell inside a buffer.
        const STARTED  = 1 << 1;
        /// The stop sample has been applied.
        const STOPPED  = 1 << 2;
        /// This mixdown is finished with the channel.
        const DONE     = 1 << 3;
        /// The client dropped its handle.
        const DETACHED = 1 << 4;
        /// Wrap the source instead of exhausting it.
        const LOOP     = 1 << 5;
    }
}

/// One slot of the shared channel array. All fields are protected by the
/// commit lock.
#[derive(Debug, Default)]
pub(crate) struct ChannelSlot {
    pub control: ControlFlags,
    pub global: GlobalFlags,
    /// Bumped every time the slot is freed; stale handles miss.
    pub serial: u32,
    pub start_time: Timestamp,
    pub stop_time: Timestamp,
    pub sound: Option<Arc<Sound>>,
    /// Parameter values the channel starts with; written directly while the
    /// channel is still in its INIT window.
    pub initial_params: [f32; PARAM_COUNT],
    /// Most recent committed value of each parameter.
    pub committed_params: [f32; PARAM_COUNT],
}

impl ChannelSlot {
    /// A slot with empty control flags is free.
    pub fn is_free(&self) -> bool {
        self.control.is_empty()
    }

    /// Claim a free slot for a new sound.
    pub fn allocate(&mut self, sound: Arc<Sound>, start_time: Timestamp, looping: bool) {
        debug_assert!(self.is_free());
        self.control = ControlFlags::INIT | ControlFlags::START;
        if looping {
            self.control |= ControlFlags::LOOP;
        }
        self.global = GlobalFlags::empty();
        self.start_time = start_time;
        self.stop_time = start_time;
        self.sound = Some(sound);
        for param in Param::ALL {
            self.initial_params[param.index()] = param.default_value();
            self.committed_params[param.index()] = param.default_value();
        }
    }

    /// Release the slot: clear flags, drop the sound reference, invalidate
    /// outstanding handles.
    pub fn release(&mut self) {
        self.control = ControlFlags::empty();
        self.global = GlobalFlags::empty();
        self.sound = None;
        self.serial = self.serial.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_free() {
        let slot = ChannelSlot::default();
        assert!(slot.is_free());
        assert!(slot.sound.is_none());
    }

    #[test]
    fn allocate_release_cycle() {
        let mut slot = ChannelSlot::default();
        let sound = Sound::from_mono(vec![0; 10], 48000);
        let serial = slot.serial;

        slot.allocate(Arc::clone(&sound), Timestamp::from_millis(100), false);
        assert!(!slot.is_free());
        assert!(slot.control.contains(ControlFlags::INIT | ControlFlags::START));
        assert_eq!(slot.start_time, Timestamp::from_millis(100));
        assert_eq!(Arc::strong_count(&sound), 2);

        slot.release();
        assert!(slot.is_free());
        assert!(slot.sound.is_none());
        assert_eq!(slot.serial, serial + 1);
        assert_eq!(Arc::strong_count(&sound), 1);
    }

    #[test]
    fn looping_allocation_sets_loop_flag() {
        let mut slot = ChannelSlot::default();
        let sound = Sound::from_mono(vec![0; 10], 48000);
        slot.allocate(sound, Timestamp::ZERO, true);
        assert!(slot.control.contains(ControlFlags::LOOP));
    }

    #[test]
    fn done_bits_map_to_kinds() {
        assert_eq!(
            GlobalFlags::done_bit(MixdownKind::Live),
            GlobalFlags::DONE_LIVE
        );
        assert_eq!(
            GlobalFlags::done_bit(MixdownKind::Record),
            GlobalFlags::DONE_RECORD
        );
    }
}
