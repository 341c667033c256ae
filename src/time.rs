use std::{
    ops::{Add, AddAssign, Sub, SubAssign},
    time::{Duration, Instant},
};

pub(crate) const NANOSECONDS_PER_SECOND: i64 = 1_000_000_000;
pub(crate) const NANOSECONDS_PER_MILLISECOND: i64 = 1_000_000;

/// A point on, or a span of, the monotonic timeline in nanoseconds.
///
/// Points are measured from the clock's epoch. Spans may be negative, which
/// is how the frame limiter represents running ahead of its schedule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nanoseconds(pub i64);

impl Nanoseconds {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms * NANOSECONDS_PER_MILLISECOND)
    }

    /// Converts a kernel `CLOCK_MONOTONIC` timestamp, such as the `tv_sec`
    /// and `tv_usec * 1000` of a DRM vblank event.
    #[must_use]
    pub const fn from_monotonic_parts(secs: i64, nanos: i64) -> Self {
        Self(secs * NANOSECONDS_PER_SECOND + nanos)
    }

    #[must_use]
    pub fn as_millis_f64(self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let ns = self.0 as f64;
        ns / NANOSECONDS_PER_MILLISECOND as f64
    }

    /// Negative spans saturate to zero.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(u64::try_from(self.0).unwrap_or(0))
    }

    #[must_use]
    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    #[must_use]
    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    pub(crate) fn to_ne_bytes(self) -> [u8; 8] {
        self.0.to_ne_bytes()
    }

    pub(crate) fn from_ne_bytes(bytes: [u8; 8]) -> Self {
        Self(i64::from_ne_bytes(bytes))
    }
}

impl Add for Nanoseconds {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Nanoseconds {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Nanoseconds {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Nanoseconds {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// A display refresh rate.
///
/// Zero means "unset". Converting zero to a period is a caller error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hertz(pub u32);

impl Hertz {
    #[must_use]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn to_period(self) -> Nanoseconds {
        debug_assert!(self.is_set(), "refresh rate must be positive");
        Nanoseconds(NANOSECONDS_PER_SECOND / i64::from(self.0))
    }
}

/// A requested frame rate. Zero disables limiting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FramesPerSecond(pub u32);

impl FramesPerSecond {
    pub const DISABLED: Self = Self(0);

    #[must_use]
    pub const fn is_disabled(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn frame_time(self) -> Nanoseconds {
        Hertz(self.0).to_period()
    }
}

/// Source of monotonic time and the sleeps the control loops block on.
///
/// The loops never read the system clock directly so that tests can drive
/// them with a manual clock.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Nanoseconds;

    /// Blocks until `deadline`. Returns immediately if it already passed.
    fn sleep_until(&self, deadline: Nanoseconds);

    fn sleep_for(&self, span: Nanoseconds);
}

/// The system monotonic clock (`CLOCK_MONOTONIC` on unix).
///
/// Timestamps share a timeline with the kernel's, so vblank times reported
/// by DRM page-flip events can be passed to the predictor unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Places an `Instant` captured elsewhere (e.g. by a page-flip handler)
    /// on this clock's timeline.
    #[must_use]
    pub fn from_instant(instant: Instant) -> Nanoseconds {
        let (now, reference) = (Self.now(), Instant::now());

        match reference.checked_duration_since(instant) {
            Some(ago) => now - Nanoseconds(duration_to_i64(ago)),
            None => now + Nanoseconds(duration_to_i64(instant - reference)),
        }
    }
}

#[cfg(unix)]
impl Clock for MonotonicClock {
    fn now(&self) -> Nanoseconds {
        let time = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .expect("CLOCK_MONOTONIC is always available");

        #[allow(clippy::useless_conversion)]
        Nanoseconds::from_monotonic_parts(i64::from(time.tv_sec()), i64::from(time.tv_nsec()))
    }

    fn sleep_until(&self, deadline: Nanoseconds) {
        self.sleep_for(deadline - self.now());
    }

    fn sleep_for(&self, span: Nanoseconds) {
        if span > Nanoseconds::ZERO {
            spin_sleep::sleep(span.as_duration());
        }
    }
}

#[cfg(not(unix))]
lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

#[cfg(not(unix))]
impl Clock for MonotonicClock {
    fn now(&self) -> Nanoseconds {
        // the epoch must exist before the reading, or the first one is negative
        let epoch = *EPOCH;
        Nanoseconds(duration_to_i64(Instant::now() - epoch))
    }

    fn sleep_until(&self, deadline: Nanoseconds) {
        self.sleep_for(deadline - self.now());
    }

    fn sleep_for(&self, span: Nanoseconds) {
        if span > Nanoseconds::ZERO {
            spin_sleep::sleep(span.as_duration());
        }
    }
}

fn duration_to_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
