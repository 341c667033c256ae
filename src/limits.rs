//! Static limits, defaults, and tuning constants.

use crate::time::Nanoseconds;

/// The draw time the vblank predictor assumes before the first frame has been
/// measured.
pub const STARTING_DRAW_TIME: Nanoseconds = Nanoseconds::from_millis(3);

/// The leeway always added on top of the measured draw time.
///
/// This also covers time that cannot be measured directly, such as the span
/// between submitting a commit and the flip actually being latched.
pub const DEFAULT_RED_ZONE: Nanoseconds = Nanoseconds::from_millis(2);

/// How strongly the rolling draw-time ceiling holds on to its peak, as a
/// fraction of [`DECAY_RANGE`].
pub const DEFAULT_DECAY_PERCENTAGE: u32 = 93;

/// The denominator for the decay percentage.
pub const DECAY_RANGE: u32 = 100;

/// How far past the predicted vblank the predictor sleeps before computing the
/// next cycle, so that hardware corrections for the vblank just passed are
/// picked up.
pub const VBLANK_GUARD: Nanoseconds = Nanoseconds::from_millis(1);

/// How many cycles pass between periodic predictor reports.
pub const VBLANK_REPORT_INTERVAL: u64 = 300;

/// A frame is late once it exceeds the target interval by this many percent.
pub const LATE_FRAME_TOLERANCE_PERCENT: i64 = 103;

/// The frame limiter's accumulated deviation never exceeds
/// `interval / DEVIATION_CLAMP_DIVISOR` in either direction.
pub const DEVIATION_CLAMP_DIVISOR: i64 = 16;

/// Clamps a decay percentage into `0..=DECAY_RANGE`.
#[must_use]
pub(crate) fn clamp_decay_percentage(value: u32) -> u32 {
    value.min(DECAY_RANGE)
}
