//! The mixer core
//!
//! Three layers, bottom-up:
//!
//! 1. **Control** ([`Mixer`]) — client-facing, callable from any thread.
//!    Allocates channels, flips per-channel control flags, appends parameter
//!    changes to the uncommitted queue.
//! 2. **Commit boundary** ([`Mixer::commit`]) — publishes the uncommitted
//!    queue and flag deltas to every active mixdown's inbox under one
//!    short-held lock and advances the commit timestamp.
//! 3. **Mixdown** ([`Mixdown`]) — one per output, driven from that output's
//!    thread. Drains its inbox, advances its time map, dispatches messages
//!    into the current buffer or defers them, and renders started channels
//!    into interleaved stereo f32.
//!
//! Data flow:
//!
//! ```text
//! client → control → uncommitted queue ─commit→ per-mixdown inbox
//!        → mixdown process queue → rendered PCM
//! ```

mod channel;
mod control;
mod envelope;
mod message;
mod mixdown;
mod timemap;

pub use channel::{ControlFlags, GlobalFlags, LocalFlags, CHANNEL_CAPACITY};
pub use control::{ChannelHandle, Mixer};
pub use message::{ParamMsg, MAX_QUEUE_MESSAGES};
pub use mixdown::{Mixdown, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};

/// Which output a mixdown renders for. The two kinds differ only in time
/// mapping: live tracks the client clock's drift, record maps exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MixdownKind {
    Live,
    Record,
}
