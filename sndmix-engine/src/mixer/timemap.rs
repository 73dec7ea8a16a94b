//! Mapping client timestamps to buffer sample positions
//!
//! The client's millisecond clock and the device's sample clock are never
//! directly comparable: the client clock jitters with frame pacing and drifts
//! against the audio crystal. The time map converts an event timestamp into a
//! sample offset relative to the start of the buffer being rendered.
//!
//! Two mappings exist:
//!
//! - **Live**: a ring of three anchors spaced [`MIXDT`] ms apart, each the
//!   sample position of a reference timestamp. A per-buffer linear regression
//!   over (samples elapsed, client ms elapsed) pairs smooths frame-pacing
//!   jitter; a cascaded exponential filter of milliseconds-per-sample supplies
//!   the slope used to extrapolate the next anchor. Interpolating between
//!   adjacent anchors gives a continuous, monotonic mapping that adapts to
//!   clock drift.
//! - **Offline**: a single anchor advanced by exactly one buffer per buffer.
//!   No drift, no regression; the mapping is arithmetic. Used by the record
//!   mixdown so a rendered file lines up exactly with the command stream.
//!
//! Sample offsets returned by [`TimeMap::sample_for`] are relative to the
//! current buffer: negative means "already in the past", `[0, bufsize)` means
//! "render at this offset", `>= bufsize` means "defer to a later buffer".

use sndmix_common::Timestamp;

/// log2 of the anchor spacing in milliseconds.
pub(crate) const MIXDT_BITS: u32 = 9;

/// Spacing between time-map anchors, in milliseconds.
pub(crate) const MIXDT: i32 = 1 << MIXDT_BITS;

/// Number of anchors in the live ring.
const NUM_ANCHORS: usize = 3;

/// Smoothing factor for the milliseconds-per-sample filter.
const RATE_FILTER_ALPHA: f64 = 0.125;

/// Inline variant selector for the two mapping algorithms. The hot path is
/// the sample loop, not the time call, so an enum beats dynamic dispatch.
#[derive(Debug)]
pub(crate) enum TimeMap {
    Live(LiveMap),
    Offline(OfflineMap),
}

impl TimeMap {
    pub fn new_live(rate: u32, bufsize: usize) -> TimeMap {
        TimeMap::Live(LiveMap::new(rate, bufsize))
    }

    pub fn new_offline(rate: u32, bufsize: usize) -> TimeMap {
        TimeMap::Offline(OfflineMap::new(rate, bufsize))
    }

    /// Anchor the map to the session time base. The offline map adopts
    /// `base` as the timestamp of its first buffer's start; the live map
    /// seeds itself from current commit times instead and ignores this.
    /// Idempotent after the first call.
    pub fn prime(&mut self, base: Timestamp) {
        if let TimeMap::Offline(map) = self {
            if !map.primed {
                map.primed = true;
                map.timeref = base;
                map.anchor = map.bufsize;
            }
        }
    }

    /// Advance the map by one buffer. `wall` and `commit` are the wall and
    /// commit timestamps drained from the mixer at the start of this buffer.
    pub fn advance(&mut self, wall: Timestamp, commit: Timestamp) {
        match self {
            TimeMap::Live(map) => map.advance(wall, commit),
            TimeMap::Offline(map) => map.advance(),
        }
    }

    /// Sample offset of timestamp `t` relative to the current buffer start.
    pub fn sample_for(&self, t: Timestamp) -> i64 {
        match self {
            TimeMap::Live(map) => map.sample_for(t),
            TimeMap::Offline(map) => map.sample_for(t),
        }
    }

    /// The client timestamp corresponding to the end of the current buffer.
    pub fn buffer_end_time(&self) -> Timestamp {
        let (timeref, anchor, rate, bufsize) = match self {
            TimeMap::Live(map) => (map.timeref, map.anchors[0], map.rate, map.bufsize),
            TimeMap::Offline(map) => (map.timeref, map.anchor, map.rate, map.bufsize),
        };
        timeref.offset((1000 * (bufsize - anchor) / rate) as i32)
    }
}

/// Drift-tracking map for the live mixdown.
#[derive(Debug)]
pub(crate) struct LiveMap {
    rate: i64,
    bufsize: i64,
    /// Extra margin folded into fresh anchors so newly committed events land
    /// beyond the device's write position.
    mixahead: i64,
    /// Timestamp whose sample position is `anchors[0]`; each later ring entry
    /// is MIXDT ms earlier.
    timeref: Timestamp,
    anchors: [i64; NUM_ANCHORS],

    // Regression accumulators over (samples elapsed, client ms elapsed),
    // reset at every anchor shift. `count` is -1 before the first buffer.
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
    count: i32,

    // Cascaded EWMA of milliseconds per sample, refreshed about once a
    // second of buffer time.
    avgdt: f64,
    avgdt_stage: f64,
    avg_prev: Timestamp,
    avg_window: u32,
    avg_left: u32,
}

impl LiveMap {
    fn new(rate: u32, bufsize: usize) -> LiveMap {
        LiveMap {
            rate: rate as i64,
            bufsize: bufsize as i64,
            mixahead: (bufsize / 2) as i64,
            timeref: Timestamp::ZERO,
            anchors: [0; NUM_ANCHORS],
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_xy: 0.0,
            count: -1,
            avgdt: 0.0,
            avgdt_stage: 0.0,
            avg_prev: Timestamp::ZERO,
            avg_window: 1,
            avg_left: 1,
        }
    }

    fn advance(&mut self, wall: Timestamp, commit: Timestamp) {
        if self.count < 0 {
            self.seed(commit);
        }
        if self.count <= 0 {
            self.sum_x = 0.0;
            self.sum_y = 0.0;
            self.sum_xx = 0.0;
            self.sum_xy = 0.0;
            self.count = 0;
        }

        // Refresh the filtered wall-clock rate once per window.
        self.avg_left -= 1;
        if self.avg_left == 0 {
            self.avg_left = self.avg_window;
            let span = (self.avg_window as i64 * self.bufsize) as f64;
            let dt = wall.delta(self.avg_prev) as f64 / span;
            self.avg_prev = wall;
            self.avgdt_stage = RATE_FILTER_ALPHA * dt + (1.0 - RATE_FILTER_ALPHA) * self.avgdt_stage;
            self.avgdt =
                RATE_FILTER_ALPHA * self.avgdt_stage + (1.0 - RATE_FILTER_ALPHA) * self.avgdt;
        }

        // Accumulate this buffer's regression point.
        self.count += 1;
        let ni = self.count as i64;
        let dti = commit.delta(self.timeref);
        let ds = (ni * self.bufsize) as f64;
        let dt = dti as f64;
        self.sum_x += ds;
        self.sum_y += dt;
        self.sum_xx += ds * ds;
        self.sum_xy += ds * dt;

        // Re-express the anchors in the new buffer's frame.
        for anchor in &mut self.anchors {
            *anchor -= self.bufsize;
        }

        if dti < 0 {
            return;
        }

        // The commit clock has passed the reference: shift the anchor ring.
        // Samples spanning 2*MIXDT at the filtered rate.
        let span_samples = (2.0 * MIXDT as f64 / self.avgdt) as i64;
        let ns = if self.count > 2 {
            // Enough data for a regression: fit t = m*s + b over the
            // accumulated points, solve for the sample where the line crosses
            // the reference time, then extrapolate half a span forward.
            let n = self.count as f64;
            let m = (n * self.sum_xy - self.sum_x * self.sum_y)
                / (n * self.sum_xx - self.sum_x * self.sum_x);
            let solved = if m * (self.rate as f64) < 500.0 {
                // Degenerate slope (client clock stalled); fall back to the
                // nominal sample count.
                ni * self.bufsize
            } else {
                let b = (self.sum_y - m * self.sum_x) / n;
                let s = -b / m;
                if s > 0.0 {
                    s as i64
                } else {
                    0
                }
            };
            solved + span_samples / 2
        } else {
            span_samples
        };

        for i in (1..NUM_ANCHORS).rev() {
            self.anchors[i] = self.anchors[i - 1];
        }
        // Never let a fresh estimate move the head below the previous anchor:
        // sample_for must stay monotonic even through clock anomalies.
        let head = ns - (ni - 1) * self.bufsize + self.mixahead;
        self.anchors[0] = head.max(self.anchors[1]);

        self.count = 0;
        self.timeref = self.timeref.offset(MIXDT);
    }

    /// Seed the map from the first drained commit time.
    fn seed(&mut self, commit: Timestamp) {
        self.timeref = commit.offset(MIXDT);
        let span = (MIXDT as f64 * 0.001 * self.rate as f64) as i64;
        for (i, anchor) in self.anchors.iter_mut().enumerate() {
            *anchor = span * (1 - i as i64) + self.bufsize * 2 + self.mixahead;
        }

        let dt = 1000.0 / self.rate as f64;
        self.avgdt = dt;
        self.avgdt_stage = dt;
        self.avg_prev = commit.offset(-((self.bufsize as f64 * dt) as i32));
        self.avg_window = (((self.rate + self.bufsize / 2) / self.bufsize).max(1)) as u32;
        self.avg_left = self.avg_window;
    }

    fn sample_for(&self, t: Timestamp) -> i64 {
        let mut dt = (t.delta(self.timeref) + 2 * MIXDT) as i64;
        let (s0, s1) = if dt < MIXDT as i64 {
            if dt <= 0 {
                return self.anchors[2];
            }
            (self.anchors[1], self.anchors[2])
        } else {
            dt -= MIXDT as i64;
            if dt >= MIXDT as i64 {
                return self.anchors[0];
            }
            (self.anchors[0], self.anchors[1])
        };
        (s0 * dt + s1 * (MIXDT as i64 - dt)) >> MIXDT_BITS
    }
}

/// Exact map for the record mixdown.
#[derive(Debug)]
pub(crate) struct OfflineMap {
    rate: i64,
    bufsize: i64,
    timeref: Timestamp,
    /// Sample position of `timeref` relative to the current buffer start.
    anchor: i64,
    primed: bool,
}

impl OfflineMap {
    fn new(rate: u32, bufsize: usize) -> OfflineMap {
        OfflineMap {
            rate: rate as i64,
            bufsize: bufsize as i64,
            timeref: Timestamp::ZERO,
            anchor: bufsize as i64,
            primed: false,
        }
    }

    fn advance(&mut self) {
        self.anchor -= self.bufsize;
        // Keep the arithmetic small: re-anchor a second forward whenever the
        // reference falls half a second behind.
        if self.anchor < -self.rate / 2 {
            self.anchor += self.rate;
            self.timeref = self.timeref.offset(1000);
        }
    }

    fn sample_for(&self, t: Timestamp) -> i64 {
        let dt = t.delta(self.timeref);
        let sec = (dt / 1000) as i64;
        let frac = (dt % 1000) as i64;
        self.anchor + sec * self.rate + frac * self.rate / 1000
    }
}
