//! Frame rate limiting.
//!
//! The limiter holds each completed frame back until the target interval has
//! elapsed since the previous one was released, then tells the compositor to
//! release its commit. A signed deviation accumulator corrects for sleep
//! overshoot so that the average rate converges on the target.

use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::{
    config::RefreshRate,
    limits::{DEVIATION_CLAMP_DIVISOR, LATE_FRAME_TOLERANCE_PERCENT},
    time::{Clock, FramesPerSecond, Hertz, Nanoseconds},
};

#[derive(Debug, thiserror::Error)]
pub enum FpsLimitError {
    #[error("The frame limiter thread could not be started: {0}")]
    Thread(#[source] std::io::Error),
}

/// The compositor-side effects of releasing a frame.
pub trait CommitSink: Send + 'static {
    /// Allow the held-back commit to be submitted.
    fn release_commit(&mut self);

    /// Deliver frame callbacks to the focused client.
    fn send_frame_done_to_focus(&mut self);

    /// Wake the compositor's main loop so it processes released commits now.
    fn nudge(&mut self);
}

/// A [`CommitSink`] that forwards each effect as a message, for compositors
/// whose main loop is driven by a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitSignal {
    ReleaseCommit,
    FrameDone,
    Nudge,
}

impl CommitSink for Sender<CommitSignal> {
    fn release_commit(&mut self) {
        forward(self, CommitSignal::ReleaseCommit);
    }

    fn send_frame_done_to_focus(&mut self) {
        forward(self, CommitSignal::FrameDone);
    }

    fn nudge(&mut self) {
        forward(self, CommitSignal::Nudge);
    }
}

fn forward(sender: &Sender<CommitSignal>, signal: CommitSignal) {
    if let Err(e) = sender.send(signal) {
        tracing::warn!("commit signal {:?} dropped: receiver disconnected", e.0);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub last_frame: Nanoseconds,
    pub current_frame: Nanoseconds,
    /// Incremented exactly once per completed frame.
    pub frame_count: u64,
    pub target_fps: FramesPerSecond,
}

/// Whether `target` divides the output refresh evenly, so frames can be paced
/// by counting vblanks.
#[must_use]
pub fn is_aligned(output_refresh: Hertz, target: FramesPerSecond) -> bool {
    !target.is_disabled()
        && output_refresh.0 / target.0 != 0
        && output_refresh.0 % target.0 == 0
}

/// Decides whether the focused client's frame callbacks are delivered on
/// vblank rather than by the limiter thread.
///
/// - Disabled limiting: always on vblank.
/// - Aligned target: paced by `vblank_count` modulo the refresh/target ratio.
/// - Unaligned target: never; the limiter delivers them.
#[must_use]
pub fn should_use_frame_callbacks_for_focus_window(
    output_refresh: Hertz,
    target: FramesPerSecond,
    vblank_count: u64,
) -> bool {
    if target.is_disabled() {
        return true;
    }

    if is_aligned(output_refresh, target) {
        let ratio = u64::from(output_refresh.0 / target.0);
        vblank_count % ratio != 0
    } else {
        false
    }
}

/// How a frame was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Over budget; released immediately.
    Late,
    /// Held back until its slot.
    OnTime,
}

/// The limiter's timing state machine.
pub struct Pacer<C: Clock> {
    clock: Arc<C>,
    deviation: Nanoseconds,
    last_release: Nanoseconds,
}

impl<C: Clock> Pacer<C> {
    pub fn new(clock: Arc<C>) -> Self {
        let last_release = clock.now();

        Self {
            clock,
            deviation: Nanoseconds::ZERO,
            last_release,
        }
    }

    /// Accumulated scheduling error. Positive when releases have been landing
    /// late.
    #[must_use]
    pub fn deviation(&self) -> Nanoseconds {
        self.deviation
    }

    #[must_use]
    pub fn last_release(&self) -> Nanoseconds {
        self.last_release
    }

    /// Releases one completed frame, sleeping first if it is early.
    pub fn pace(&mut self, target: FramesPerSecond, sink: &mut impl CommitSink) -> Release {
        let interval = target.frame_time();
        let start = self.last_release;

        // Not the client's frame time; the time since the last release.
        let frame_time = self.clock.now() - start;

        tracing::trace!(
            "frame time = {:.2}ms - target {:.2}ms - deviation {:.2}ms",
            frame_time.as_millis_f64(),
            interval.as_millis_f64(),
            self.deviation.as_millis_f64(),
        );

        let budget = interval.0 * LATE_FRAME_TOLERANCE_PERCENT - self.deviation.0 * 100;

        let release = if frame_time.0 * 100 > budget {
            // A slow frame must not be paid back by later ones.
            self.deviation = Nanoseconds::ZERO;
            Release::Late
        } else {
            let now = self.clock.now();
            let mut target_point = now + interval - self.deviation - frame_time;

            while target_point < now {
                target_point += interval;
            }

            self.clock.sleep_until(target_point);

            let frame_time = self.clock.now() - start;
            let bound = Nanoseconds(interval.0 / DEVIATION_CLAMP_DIVISOR);
            self.deviation =
                (self.deviation + frame_time - interval).clamp(Nanoseconds(-bound.0), bound);

            Release::OnTime
        };

        sink.release_commit();
        self.last_release = self.clock.now();

        release
    }
}

enum Message {
    Wake,
    Exit,
}

#[derive(Debug, Default)]
struct Shared {
    frame_info: Mutex<FrameInfo>,
}

/// The limiter's per-thread state.
struct FpsLimitThread<C: Clock, S: CommitSink> {
    shared: Arc<Shared>,
    refresh: Arc<RefreshRate>,
    receiver: Receiver<Message>,
    pacer: Pacer<C>,
    sink: S,
    last_frame_count: u64,
}

impl<C: Clock, S: CommitSink> FpsLimitThread<C, S> {
    /// Blocks until limiting is enabled and a new frame has completed.
    /// Returns `None` once asked to exit.
    fn wait(&mut self) -> Option<FrameInfo> {
        loop {
            match self.receiver.recv() {
                Ok(Message::Wake) => {}
                Ok(Message::Exit) | Err(_) => return None,
            }

            let info = *self.shared.frame_info.lock();
            if !info.target_fps.is_disabled() && info.frame_count != self.last_frame_count {
                return Some(info);
            }
        }
    }

    fn step(&mut self, info: FrameInfo) -> Release {
        self.last_frame_count = info.frame_count;

        let release = self.pacer.pace(info.target_fps, &mut self.sink);

        if !is_aligned(self.refresh.output(), info.target_fps) {
            self.sink.send_frame_done_to_focus();
            self.sink.nudge();
        }

        release
    }

    fn run(mut self) {
        tracing::info!("Starting frame limiter");

        while let Some(info) = self.wait() {
            self.step(info);
        }

        tracing::info!("Stopping frame limiter");
    }
}

/// Lifetime control object and handle for the limiter thread. Drop this to
/// stop it.
pub struct FpsLimiter<C: Clock> {
    shared: Arc<Shared>,
    refresh: Arc<RefreshRate>,
    clock: Arc<C>,
    sender: Sender<Message>,
    joiner: Option<JoinHandle<()>>,
}

impl<C: Clock> FpsLimiter<C> {
    #[tracing::instrument(skip_all)]
    pub fn spawn<S: CommitSink>(
        refresh: Arc<RefreshRate>,
        clock: Arc<C>,
        sink: S,
    ) -> Result<Self, FpsLimitError> {
        let now = clock.now();
        let shared = Arc::new(Shared {
            frame_info: Mutex::new(FrameInfo {
                last_frame: now,
                current_frame: now,
                frame_count: 0,
                target_fps: FramesPerSecond::DISABLED,
            }),
        });

        let (sender, receiver) = channel();

        let thread = FpsLimitThread {
            shared: shared.clone(),
            refresh: refresh.clone(),
            receiver,
            pacer: Pacer::new(clock.clone()),
            sink,
            last_frame_count: 0,
        };

        let joiner = std::thread::Builder::new()
            .name("framepace-fps".to_owned())
            .spawn(move || thread.run())
            .map_err(FpsLimitError::Thread)?;

        Ok(Self {
            shared,
            refresh,
            clock,
            sender,
            joiner: Some(joiner),
        })
    }

    /// Marks the completion of a frame. Safe to call from any thread; only
    /// holds the frame-info lock briefly.
    pub fn mark_frame(&self) {
        let now = self.clock.now();

        {
            let mut info = self.shared.frame_info.lock();
            info.last_frame = info.current_frame;
            info.current_frame = now;
            info.frame_count += 1;
        }

        self.wake();
    }

    /// Sets the target rate. `FramesPerSecond::DISABLED` turns limiting off.
    pub fn set_target(&self, target: FramesPerSecond) {
        let previous = std::mem::replace(&mut self.shared.frame_info.lock().target_fps, target);

        if previous != target {
            tracing::info!("Frame limit target changed from {} to {}", previous.0, target.0);
        }

        self.wake();
    }

    pub fn frame_info(&self) -> FrameInfo {
        *self.shared.frame_info.lock()
    }

    /// [`should_use_frame_callbacks_for_focus_window`] against the current
    /// output refresh.
    pub fn should_use_frame_callbacks_for_focus_window(
        &self,
        target: FramesPerSecond,
        vblank_count: u64,
    ) -> bool {
        should_use_frame_callbacks_for_focus_window(self.refresh.output(), target, vblank_count)
    }

    fn wake(&self) {
        if self.sender.send(Message::Wake).is_err() {
            tracing::warn!("The frame limiter thread has exited; frame not paced.");
        }
    }
}

impl<C: Clock> Drop for FpsLimiter<C> {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Exit);

        if let Some(joiner) = self.joiner.take() {
            if joiner.join().is_err() {
                tracing::error!("The frame limiter thread panicked.");
            }
        }
    }
}

/// Starts the limiter on the monotonic clock.
pub fn fps_limit_init<S: CommitSink>(
    refresh: Arc<RefreshRate>,
    sink: S,
) -> Result<FpsLimiter<crate::time::MonotonicClock>, FpsLimitError> {
    FpsLimiter::spawn(refresh, Arc::new(crate::time::MonotonicClock), sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    const FPS_60: FramesPerSecond = FramesPerSecond(60);

    #[derive(Default)]
    struct Recorder {
        signals: Vec<CommitSignal>,
    }

    impl CommitSink for Recorder {
        fn release_commit(&mut self) {
            self.signals.push(CommitSignal::ReleaseCommit);
        }

        fn send_frame_done_to_focus(&mut self) {
            self.signals.push(CommitSignal::FrameDone);
        }

        fn nudge(&mut self) {
            self.signals.push(CommitSignal::Nudge);
        }
    }

    /// Wakes `error` away from every deadline, but never before it slept.
    struct SloppyClock {
        inner: ManualClock,
        error: Nanoseconds,
    }

    impl Clock for SloppyClock {
        fn now(&self) -> Nanoseconds {
            self.inner.now()
        }

        fn sleep_until(&self, deadline: Nanoseconds) {
            self.inner.sleep_until(deadline + self.error);
        }

        fn sleep_for(&self, span: Nanoseconds) {
            self.sleep_until(self.now() + span);
        }
    }

    #[test]
    fn disabled_target_uses_vblank_callbacks() {
        for count in 0..4 {
            assert!(should_use_frame_callbacks_for_focus_window(
                Hertz(60),
                FramesPerSecond::DISABLED,
                count
            ));
        }
    }

    #[test]
    fn aligned_target_alternates() {
        let decisions: Vec<_> = (0..6)
            .map(|count| {
                should_use_frame_callbacks_for_focus_window(Hertz(60), FramesPerSecond(30), count)
            })
            .collect();

        assert_eq!(decisions, [false, true, false, true, false, true]);
        assert!(is_aligned(Hertz(60), FramesPerSecond(20)));
        assert!(is_aligned(Hertz(144), FramesPerSecond(72)));
    }

    #[test]
    fn unaligned_target_never_uses_vblank_callbacks() {
        for count in 0..6 {
            assert!(!should_use_frame_callbacks_for_focus_window(
                Hertz(60),
                FramesPerSecond(40),
                count
            ));
        }

        // faster than the display
        assert!(!is_aligned(Hertz(60), FramesPerSecond(120)));
        assert!(!is_aligned(Hertz(0), FramesPerSecond(30)));
    }

    #[test]
    fn early_frame_sleeps_to_interval() {
        let clock = Arc::new(ManualClock::new(Nanoseconds::ZERO));
        let mut pacer = Pacer::new(clock.clone());
        let mut sink = Recorder::default();

        clock.advance(Nanoseconds::from_millis(10));
        assert_eq!(pacer.pace(FPS_60, &mut sink), Release::OnTime);

        assert_eq!(clock.now(), FPS_60.frame_time());
        assert_eq!(pacer.last_release(), FPS_60.frame_time());
        assert_eq!(pacer.deviation(), Nanoseconds::ZERO);
        assert_eq!(sink.signals, [CommitSignal::ReleaseCommit]);
    }

    #[test]
    fn late_frame_releases_immediately() {
        let clock = Arc::new(SloppyClock {
            inner: ManualClock::new(Nanoseconds::ZERO),
            error: Nanoseconds::from_millis(1),
        });
        let mut pacer = Pacer::new(clock.clone());
        let mut sink = Recorder::default();

        // build up some positive deviation first
        clock.inner.advance(Nanoseconds::from_millis(5));
        assert_eq!(pacer.pace(FPS_60, &mut sink), Release::OnTime);
        assert!(pacer.deviation() > Nanoseconds::ZERO);

        let before = clock.now();
        clock.inner.advance(Nanoseconds::from_millis(20));
        assert_eq!(pacer.pace(FPS_60, &mut sink), Release::Late);

        assert_eq!(clock.now(), before + Nanoseconds::from_millis(20));
        assert_eq!(pacer.deviation(), Nanoseconds::ZERO);
        assert_eq!(sink.signals.len(), 2);
    }

    #[test]
    fn deviation_stays_bounded() {
        for error_ms in [-3, -1, 1, 2, 5] {
            let clock = Arc::new(SloppyClock {
                inner: ManualClock::new(Nanoseconds::ZERO),
                error: Nanoseconds::from_millis(error_ms),
            });
            let mut pacer = Pacer::new(clock.clone());
            let mut sink = Recorder::default();
            let bound = FPS_60.frame_time().0 / DEVIATION_CLAMP_DIVISOR;

            for _ in 0..50 {
                clock.inner.advance(Nanoseconds::from_millis(4));
                pacer.pace(FPS_60, &mut sink);
                assert!(pacer.deviation().abs().0 <= bound);
            }
        }
    }

    #[test]
    fn deviation_pulls_schedule_back() {
        let clock = Arc::new(SloppyClock {
            inner: ManualClock::new(Nanoseconds::ZERO),
            error: Nanoseconds(500_000),
        });
        let mut pacer = Pacer::new(clock.clone());
        let mut sink = Recorder::default();
        let interval = FPS_60.frame_time();

        clock.inner.advance(Nanoseconds::from_millis(2));
        pacer.pace(FPS_60, &mut sink);
        assert_eq!(pacer.deviation(), Nanoseconds(500_000));

        // the next slot is shortened by the accumulated deviation, so the
        // oversleep lands exactly on the interval
        let start = pacer.last_release();
        clock.inner.advance(Nanoseconds::from_millis(2));
        pacer.pace(FPS_60, &mut sink);
        assert_eq!(pacer.last_release() - start, interval);
        assert_eq!(pacer.deviation(), Nanoseconds(500_000));
    }

    #[test]
    fn disconnected_sender_sink_keeps_going() {
        let (mut sender, signals) = channel::<CommitSignal>();
        sender.release_commit();
        drop(signals);

        sender.release_commit();
        sender.send_frame_done_to_focus();
        sender.nudge();
    }
}
