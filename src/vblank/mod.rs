//! Vblank prediction.
//!
//! The predictor runs on its own thread and wakes the compositor a little
//! before each vertical blank, early enough to render and commit in time.
//! It learns where vblanks fall only through
//! [`VblankHandle::mark_possible_vblank`], and how long a frame takes only
//! through [`VblankHandle::set_draw_time`]. Everything else is extrapolated
//! from the refresh rate.

mod channel;
mod estimator;

use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        mpsc::{channel as message_channel, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread::JoinHandle,
};

pub use self::{
    channel::{NotifyError, VblankSink},
    estimator::{next_wake_point, DrawTimeEstimator, Estimate},
};

#[cfg(unix)]
pub use self::channel::{channel, VblankReceiver, VblankWriter};

use crate::{
    config::{PacingConfig, RefreshRate, Tunables},
    limits::{VBLANK_GUARD, VBLANK_REPORT_INTERVAL},
    time::{Clock, Nanoseconds},
};

#[derive(Debug, thiserror::Error)]
pub enum VblankError {
    #[error("The vblank notification channel could not be created: {0}")]
    Channel(#[source] std::io::Error),
    #[error("The vblank thread could not be started: {0}")]
    Thread(#[source] std::io::Error),
}

/// Timing state shared between the predictor and its writers.
///
/// `last_vblank` is written by whatever observes the display (page-flip
/// events, hardware timestamps), `draw_time` by the renderer after each frame.
/// Both are single-writer heuristics read with relaxed ordering.
#[derive(Debug)]
struct VblankState {
    last_vblank: AtomicI64,
    draw_time: AtomicI64,
    tunables: Tunables,
}

/// A cloneable capability for feeding the predictor.
#[derive(Clone, Debug)]
pub struct VblankHandle {
    state: Arc<VblankState>,
}

impl VblankHandle {
    fn new(config: &PacingConfig, last_vblank: Nanoseconds) -> Self {
        Self {
            state: Arc::new(VblankState {
                last_vblank: AtomicI64::new(last_vblank.0),
                draw_time: AtomicI64::new(config.starting_draw_time.0),
                tunables: Tunables::new(config),
            }),
        }
    }

    /// Records a time at which a vblank is believed to have occurred. This is
    /// the predictor's only source of drift correction.
    pub fn mark_possible_vblank(&self, time: Nanoseconds) {
        self.state.last_vblank.store(time.0, Ordering::Relaxed);
    }

    /// Records how long the most recent frame took to render and commit.
    pub fn set_draw_time(&self, draw_time: Nanoseconds) {
        self.state.draw_time.store(draw_time.0, Ordering::Relaxed);
    }

    pub fn last_vblank(&self) -> Nanoseconds {
        Nanoseconds(self.state.last_vblank.load(Ordering::Relaxed))
    }

    pub fn draw_time(&self) -> Nanoseconds {
        Nanoseconds(self.state.draw_time.load(Ordering::Relaxed))
    }

    pub fn tunables(&self) -> &Tunables {
        &self.state.tunables
    }
}

/// The predictor's per-thread state. `tick` runs one full cycle.
pub struct VblankThread<C: Clock, S: VblankSink> {
    handle: VblankHandle,
    refresh: Arc<RefreshRate>,
    clock: Arc<C>,
    sink: S,

    estimator: DrawTimeEstimator,
    cycle: u64,
    last_offset: Nanoseconds,
}

impl<C: Clock, S: VblankSink> VblankThread<C, S> {
    pub fn new(
        config: &PacingConfig,
        refresh: Arc<RefreshRate>,
        clock: Arc<C>,
        sink: S,
    ) -> (Self, VblankHandle) {
        let handle = VblankHandle::new(config, clock.now());

        let thread = Self {
            handle: handle.clone(),
            refresh,
            clock,
            sink,
            estimator: DrawTimeEstimator::new(config.starting_draw_time),
            cycle: 0,
            last_offset: config.starting_draw_time + config.red_zone,
        };

        (thread, handle)
    }

    #[must_use]
    pub fn rolling_max_draw_time(&self) -> Nanoseconds {
        self.estimator.rolling_max()
    }

    /// Sleeps until the next wake point, notifies the sink, then sleeps past
    /// the predicted vblank. Returns the wake time and the estimate it was
    /// scheduled with.
    pub fn tick(&mut self) -> (Nanoseconds, Estimate) {
        let tunables = self.handle.tunables();
        let red_zone = tunables.red_zone();
        let decay_percentage = tunables.decay_percentage();
        let draw_time = self.handle.draw_time();

        let estimate = self.estimator.update(
            self.refresh.current(),
            draw_time,
            red_zone,
            decay_percentage,
        );

        self.report(draw_time, red_zone, decay_percentage, &estimate);

        let now = self.clock.now();
        let target = next_wake_point(
            self.handle.last_vblank(),
            estimate.offset,
            estimate.interval,
            now,
        );

        self.clock.sleep_until(target);
        let wake_time = self.clock.now();

        {
            #[cfg(feature = "profile")]
            let _s = tracing_tracy::client::span!("VSync");

            match self.sink.notify(wake_time) {
                Ok(()) => tracing::trace!(?wake_time, "sent vblank"),
                Err(e) => tracing::warn!("Dropping vblank notification: {e}"),
            }
        }

        // Get past the vblank so corrections for it land before the next
        // anchor is computed.
        self.clock.sleep_for(estimate.offset + VBLANK_GUARD);

        (wake_time, estimate)
    }

    fn report(
        &mut self,
        draw_time: Nanoseconds,
        red_zone: Nanoseconds,
        decay_percentage: u32,
        estimate: &Estimate,
    ) {
        let missed = draw_time > self.last_offset;

        if missed {
            tracing::warn!(
                "Missed vblank: draw time {:.2}ms exceeded offset {:.2}ms",
                draw_time.as_millis_f64(),
                self.last_offset.as_millis_f64(),
            );
        }

        if missed || self.cycle % VBLANK_REPORT_INTERVAL == 0 {
            tracing::debug!(
                "red zone: {:.2}ms decay: {}% rolling max: {:.2}ms draw time: {:.2}ms offset: {:.2}ms",
                red_zone.as_millis_f64(),
                decay_percentage,
                estimate.rolling_max.as_millis_f64(),
                draw_time.as_millis_f64(),
                estimate.offset.as_millis_f64(),
            );
        }

        self.cycle += 1;
        self.last_offset = estimate.offset;
    }
}

/// Lifetime control object for the predictor thread. Drop this to stop it.
pub struct VblankPredictor {
    handle: VblankHandle,
    stop: Sender<()>,
    joiner: Option<JoinHandle<()>>,
}

impl VblankPredictor {
    /// Starts the predictor thread with a caller-provided clock and sink.
    #[tracing::instrument(skip_all)]
    pub fn spawn<C: Clock, S: VblankSink>(
        config: &PacingConfig,
        refresh: Arc<RefreshRate>,
        clock: Arc<C>,
        sink: S,
    ) -> Result<Self, VblankError> {
        let (mut thread, handle) = VblankThread::new(config, refresh, clock, sink);
        let (stop, stop_receiver) = message_channel();

        let joiner = std::thread::Builder::new()
            .name("framepace-vblank".to_owned())
            .spawn(move || {
                tracing::info!("Starting vblank predictor");

                while !should_stop(&stop_receiver) {
                    thread.tick();
                }

                tracing::info!("Stopping vblank predictor");
            })
            .map_err(VblankError::Thread)?;

        Ok(Self {
            handle,
            stop,
            joiner: Some(joiner),
        })
    }

    pub fn handle(&self) -> &VblankHandle {
        &self.handle
    }
}

impl Drop for VblankPredictor {
    fn drop(&mut self) {
        // the thread may already be gone if it panicked
        let _ = self.stop.send(());

        if let Some(joiner) = self.joiner.take() {
            if joiner.join().is_err() {
                tracing::error!("The vblank predictor thread panicked.");
            }
        }
    }
}

fn should_stop(receiver: &Receiver<()>) -> bool {
    !matches!(receiver.try_recv(), Err(TryRecvError::Empty))
}

/// Starts the predictor on the monotonic clock and returns the compositor's
/// end of the notification channel.
#[cfg(unix)]
pub fn vblank_init(
    config: &PacingConfig,
    refresh: Arc<RefreshRate>,
) -> Result<(VblankPredictor, VblankReceiver), VblankError> {
    let (writer, receiver) = channel().map_err(|e| {
        tracing::error!("Failed to create the vblank notification channel: {e}");
        VblankError::Channel(e)
    })?;

    let predictor =
        VblankPredictor::spawn(config, refresh, Arc::new(crate::time::MonotonicClock), writer)?;

    Ok((predictor, receiver))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;

    use super::*;
    use crate::{testing::ManualClock, time::Hertz};

    fn setup(
        config: &PacingConfig,
        start: Nanoseconds,
    ) -> (
        VblankThread<ManualClock, std::sync::mpsc::SyncSender<Nanoseconds>>,
        VblankHandle,
        Arc<ManualClock>,
        Receiver<Nanoseconds>,
    ) {
        let clock = Arc::new(ManualClock::new(start));
        let refresh = Arc::new(RefreshRate::new(Hertz(60)));
        let (sender, receiver) = sync_channel(4);
        let (thread, handle) = VblankThread::new(config, refresh, clock.clone(), sender);
        (thread, handle, clock, receiver)
    }

    #[test]
    fn wakes_offset_before_each_vblank() {
        let start = Nanoseconds::from_millis(1000);
        let (mut thread, _handle, clock, receiver) = setup(&PacingConfig::default(), start);
        let interval = Hertz(60).to_period();

        let (wake, estimate) = thread.tick();
        assert_eq!(estimate.rolling_max, Nanoseconds::from_millis(3));
        assert_eq!(estimate.offset, Nanoseconds::from_millis(5));
        assert_eq!(wake, start - estimate.offset + interval);
        assert_eq!(receiver.try_recv(), Ok(wake));

        // after the tick the thread has slept past the vblank it targeted
        assert_eq!(clock.now(), wake + estimate.offset + VBLANK_GUARD);
    }

    #[test]
    fn follows_hardware_corrections() {
        let start = Nanoseconds::from_millis(1000);
        let (mut thread, handle, _clock, receiver) = setup(&PacingConfig::default(), start);
        let interval = Hertz(60).to_period();

        let (first, _) = thread.tick();

        // the display reports the real vblank 1ms later than predicted
        let vblank = first + Nanoseconds::from_millis(5) + Nanoseconds::from_millis(1);
        handle.mark_possible_vblank(vblank);

        let (second, estimate) = thread.tick();
        assert_eq!(second, vblank - estimate.offset + interval);
        assert_eq!(receiver.try_recv(), Ok(first));
        assert_eq!(receiver.try_recv(), Ok(second));
    }

    #[test]
    fn missed_cycles_are_skipped() {
        let start = Nanoseconds::from_millis(1000);
        let (mut thread, _handle, clock, _receiver) = setup(&PacingConfig::default(), start);
        let interval = Hertz(60).to_period();

        // stall for several refreshes without any vblank feedback
        clock.advance(Nanoseconds::from_millis(100));
        let now = clock.now();

        let (wake, estimate) = thread.tick();
        assert!(wake >= now);
        assert!(wake - now < interval);
        assert_eq!((wake - (start - estimate.offset)).0 % interval.0, 0);
    }

    #[test]
    fn draw_time_spike_widens_offset() {
        let start = Nanoseconds::from_millis(1000);
        let (mut thread, handle, _clock, _receiver) = setup(&PacingConfig::default(), start);

        handle.set_draw_time(Nanoseconds::from_millis(6));
        let (_, estimate) = thread.tick();
        assert_eq!(estimate.rolling_max, Nanoseconds::from_millis(6));
        assert_eq!(estimate.offset, Nanoseconds::from_millis(8));

        handle.set_draw_time(Nanoseconds::from_millis(1));
        let (_, estimate) = thread.tick();
        assert!(estimate.rolling_max < Nanoseconds::from_millis(6));
        assert!(estimate.rolling_max > Nanoseconds::from_millis(1));
        assert_eq!(thread.rolling_max_draw_time(), estimate.rolling_max);
    }

    #[test]
    fn full_channel_does_not_stall() {
        let start = Nanoseconds::from_millis(1000);
        let (mut thread, _handle, _clock, receiver) = setup(&PacingConfig::default(), start);

        let wakes: Vec<_> = (0..8).map(|_| thread.tick().0).collect();

        let delivered: Vec<_> = receiver.try_iter().collect();
        assert_eq!(delivered, wakes[..4].to_vec());
    }

    #[test]
    fn tunables_apply_next_cycle() {
        let start = Nanoseconds::from_millis(1000);
        let (mut thread, handle, _clock, _receiver) = setup(&PacingConfig::default(), start);

        handle.tunables().set_red_zone(Nanoseconds::from_millis(4));
        handle.tunables().set_decay_percentage(0);
        handle.set_draw_time(Nanoseconds::from_millis(2));

        let (_, estimate) = thread.tick();
        assert_eq!(estimate.rolling_max, Nanoseconds::from_millis(2));
        assert_eq!(estimate.offset, Nanoseconds::from_millis(6));
    }
}
