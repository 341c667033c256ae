//! Startup configuration and the shared, runtime-adjustable timing cells.
//!
//! The cells in this module are advisory inputs to the control loops. Every
//! access uses `Ordering::Relaxed`: a reader observing a value one cycle late
//! only delays how quickly a change takes effect, it never produces an
//! inconsistent schedule.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::{
    limits::{
        clamp_decay_percentage, DEFAULT_DECAY_PERCENTAGE, DEFAULT_RED_ZONE, STARTING_DRAW_TIME,
    },
    time::{Hertz, Nanoseconds},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    /// Fixed margin added to the estimated draw time.
    pub red_zone: Nanoseconds,
    /// How much of the draw-time peak survives each cycle, out of 100.
    pub decay_percentage: u32,
    /// The draw time assumed until the first frame is measured.
    pub starting_draw_time: Nanoseconds,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            red_zone: DEFAULT_RED_ZONE,
            decay_percentage: DEFAULT_DECAY_PERCENTAGE,
            starting_draw_time: STARTING_DRAW_TIME,
        }
    }
}

/// Predictor tunables. Rarely written, read once per cycle.
#[derive(Debug)]
pub struct Tunables {
    red_zone: AtomicI64,
    decay_percentage: AtomicU32,
}

impl Tunables {
    #[must_use]
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            red_zone: AtomicI64::new(config.red_zone.0),
            decay_percentage: AtomicU32::new(clamp_decay_percentage(config.decay_percentage)),
        }
    }

    pub fn red_zone(&self) -> Nanoseconds {
        Nanoseconds(self.red_zone.load(Ordering::Relaxed))
    }

    pub fn set_red_zone(&self, red_zone: Nanoseconds) {
        self.red_zone.store(red_zone.0.max(0), Ordering::Relaxed);
    }

    pub fn decay_percentage(&self) -> u32 {
        self.decay_percentage.load(Ordering::Relaxed)
    }

    /// Values above 100 are clamped.
    pub fn set_decay_percentage(&self, percentage: u32) {
        self.decay_percentage
            .store(clamp_decay_percentage(percentage), Ordering::Relaxed);
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new(&PacingConfig::default())
    }
}

/// The refresh rates of the output being driven.
///
/// When running nested inside another compositor, the nested (virtual)
/// refresh takes precedence over the physical output's.
#[derive(Debug, Default)]
pub struct RefreshRate {
    output: AtomicU32,
    nested: AtomicU32,
}

impl RefreshRate {
    #[must_use]
    pub fn new(output: Hertz) -> Self {
        Self {
            output: AtomicU32::new(output.0),
            nested: AtomicU32::new(0),
        }
    }

    pub fn output(&self) -> Hertz {
        Hertz(self.output.load(Ordering::Relaxed))
    }

    pub fn set_output(&self, refresh: Hertz) {
        self.output.store(refresh.0, Ordering::Relaxed);
    }

    pub fn nested(&self) -> Hertz {
        Hertz(self.nested.load(Ordering::Relaxed))
    }

    /// Pass `Hertz(0)` to fall back to the output refresh.
    pub fn set_nested(&self, refresh: Hertz) {
        self.nested.store(refresh.0, Ordering::Relaxed);
    }

    /// The rate vblanks are paced at: nested if set, output otherwise.
    pub fn current(&self) -> Hertz {
        let nested = self.nested();
        if nested.is_set() {
            nested
        } else {
            self.output()
        }
    }
}
