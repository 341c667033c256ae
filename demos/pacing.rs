//! Drives both pacing loops with a simulated compositor for a few seconds.
//!
//! The "renderer" takes a random-ish 2-6ms per frame, and the "display"
//! reports each vblank back to the predictor, 1ms later than predicted.

use std::{
    sync::{mpsc::channel, Arc},
    time::{Duration, Instant},
};

use framepace::{
    fps_limit_init, Clock, CommitSignal, FramesPerSecond, Hertz, MonotonicClock, Nanoseconds,
    PacingConfig, RefreshRate,
};

const RUN_FOR: Duration = Duration::from_secs(3);

#[cfg(unix)]
pub fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let refresh = Arc::new(RefreshRate::new(Hertz(60)));
    let config = PacingConfig::default();

    let (predictor, wakes) = framepace::vblank_init(&config, refresh.clone()).unwrap();
    let (sender, signals) = channel();
    let limiter = fps_limit_init(refresh.clone(), sender).unwrap();
    limiter.set_target(FramesPerSecond(40));

    let clock = MonotonicClock;
    let started = Instant::now();
    let mut frames = 0u64;
    let mut released = 0u64;

    while started.elapsed() < RUN_FOR {
        let Some(wake) = wakes.latest().unwrap() else {
            std::thread::sleep(Duration::from_micros(250));
            continue;
        };

        // pretend to render
        let draw_time = Nanoseconds::from_millis(2 + (frames % 5) as i64);
        clock.sleep_for(draw_time);
        predictor.handle().set_draw_time(draw_time);
        limiter.mark_frame();
        frames += 1;

        // the display flips shortly after the predicted vblank
        let offset = config.red_zone + predictor.handle().draw_time();
        predictor
            .handle()
            .mark_possible_vblank(wake + offset + Nanoseconds::from_millis(1));

        released += signals
            .try_iter()
            .filter(|signal| *signal == CommitSignal::ReleaseCommit)
            .count() as u64;
    }

    let seconds = started.elapsed().as_secs_f64();
    println!(
        "{frames} frames ({:.1} fps), {released} releases ({:.1} fps)",
        frames as f64 / seconds,
        released as f64 / seconds,
    );
}

#[cfg(not(unix))]
pub fn main() {
    println!("The vblank notification channel requires a unix platform.");
}
