use crate::{
    limits::DECAY_RANGE,
    time::{Hertz, Nanoseconds},
};

/// A decaying ceiling over recent draw times.
///
/// While draw times stay below the ceiling, it behaves as a rolling average
/// toward the current draw time. A draw time above the ceiling replaces it
/// outright, so a spike is budgeted for immediately and then decays away
/// over the following cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawTimeEstimator {
    rolling_max: Nanoseconds,
}

/// The outcome of one estimator update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Estimate {
    pub interval: Nanoseconds,
    pub rolling_max: Nanoseconds,
    /// How long before the vblank the consumer is woken.
    pub offset: Nanoseconds,
}

impl DrawTimeEstimator {
    #[must_use]
    pub fn new(starting_draw_time: Nanoseconds) -> Self {
        Self {
            rolling_max: starting_draw_time.clamp(Nanoseconds::ZERO, Nanoseconds(i64::MAX)),
        }
    }

    #[must_use]
    pub fn rolling_max(&self) -> Nanoseconds {
        self.rolling_max
    }

    /// Folds `draw_time` into the ceiling and derives this cycle's offset.
    ///
    /// `offset` never exceeds half of the refresh interval unless `red_zone`
    /// alone already does.
    pub fn update(
        &mut self,
        refresh: Hertz,
        draw_time: Nanoseconds,
        red_zone: Nanoseconds,
        decay_percentage: u32,
    ) -> Estimate {
        let interval = refresh.to_period();
        let alpha = i64::from(decay_percentage.min(DECAY_RANGE));
        let range = i64::from(DECAY_RANGE);
        // anything longer than a whole interval is clamped away below anyway
        let draw_time = draw_time.0.clamp(0, interval.0);
        let red_zone = red_zone.0.max(0);

        let peak = self.rolling_max.0.min(interval.0).max(draw_time);
        let mut rolling_max = (alpha * peak + (range - alpha) * draw_time) / range;

        rolling_max = rolling_max.saturating_add(red_zone).min(interval.0 / 2) - red_zone;
        self.rolling_max = Nanoseconds(rolling_max.max(0));

        Estimate {
            interval,
            rolling_max: self.rolling_max,
            offset: Nanoseconds(self.rolling_max.0.saturating_add(red_zone)),
        }
    }
}

/// The first wake point after `now` on the cadence anchored at the last
/// known vblank.
///
/// The previous wake point already sat `offset` before the vblank it
/// targeted, so the anchor is `last_vblank - offset`.
#[must_use]
pub fn next_wake_point(
    last_vblank: Nanoseconds,
    offset: Nanoseconds,
    interval: Nanoseconds,
    now: Nanoseconds,
) -> Nanoseconds {
    let anchor = last_vblank - offset;
    let mut target = anchor + interval;

    if target < now {
        // skip every missed cycle at once
        let behind = now.0 - target.0;
        let cycles = behind / interval.0 + i64::from(behind % interval.0 != 0);
        target.0 += cycles * interval.0;
    }

    target
}
