//! Frame pacing for a compositor.
//!
//! Two independent control loops decide when a frame may be submitted:
//!
//! - [`vblank`] predicts the next vertical blank and wakes the compositor
//!   early enough to render and commit before it.
//! - [`fps_limit`] optionally holds completed frames back to a target rate.
//!
//! Each loop runs on a dedicated thread and only talks outward: the predictor
//! through a non-blocking notification channel, the limiter through a
//! [`fps_limit::CommitSink`].

pub mod config;
pub mod fps_limit;
pub mod limits;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod time;
pub mod vblank;

pub use config::{PacingConfig, RefreshRate, Tunables};
pub use fps_limit::{
    fps_limit_init, should_use_frame_callbacks_for_focus_window, CommitSignal, CommitSink,
    FpsLimitError, FpsLimiter, FrameInfo,
};
pub use time::{Clock, FramesPerSecond, Hertz, MonotonicClock, Nanoseconds};
#[cfg(unix)]
pub use vblank::{vblank_init, VblankReceiver};
pub use vblank::{VblankError, VblankHandle, VblankPredictor, VblankSink};
