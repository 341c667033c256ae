//! A hand-driven clock for exercising the control loops deterministically.

use parking_lot::{Condvar, Mutex};

use crate::time::{Clock, Nanoseconds};

#[derive(Debug)]
struct State {
    now: Nanoseconds,
    /// When set, sleeps block until the clock is advanced past the deadline.
    stepped: bool,
}

/// A clock that only moves when told to.
///
/// In the default mode a sleep simply jumps the clock to its deadline, which
/// suits driving a loop one iteration at a time from the test thread. In
/// stepped mode sleeps block until another thread calls [`advance`] or
/// [`set`], which suits loops running on their own thread.
///
/// [`advance`]: ManualClock::advance
/// [`set`]: ManualClock::set
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<State>,
    changed: Condvar,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Nanoseconds) -> Self {
        Self {
            state: Mutex::new(State {
                now: start,
                stepped: false,
            }),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn stepped(start: Nanoseconds) -> Self {
        let clock = Self::new(start);
        clock.state.lock().stepped = true;
        clock
    }

    pub fn advance(&self, span: Nanoseconds) {
        let mut state = self.state.lock();
        state.now += span;
        self.changed.notify_all();
    }

    pub fn set(&self, now: Nanoseconds) {
        let mut state = self.state.lock();
        state.now = state.now.max(now);
        self.changed.notify_all();
    }

    /// Leaves stepped mode, waking every sleeper.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.stepped = false;
        self.changed.notify_all();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanoseconds {
        self.state.lock().now
    }

    fn sleep_until(&self, deadline: Nanoseconds) {
        let mut state = self.state.lock();

        while state.stepped && state.now < deadline {
            self.changed.wait(&mut state);
        }

        state.now = state.now.max(deadline);
    }

    fn sleep_for(&self, span: Nanoseconds) {
        let deadline = self.now() + span;
        self.sleep_until(deadline);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn sleep_jumps_to_deadline() {
        let clock = ManualClock::new(Nanoseconds(10));
        clock.sleep_until(Nanoseconds(50));
        assert_eq!(clock.now(), Nanoseconds(50));

        // past deadlines do not move the clock backwards
        clock.sleep_until(Nanoseconds(20));
        assert_eq!(clock.now(), Nanoseconds(50));

        clock.sleep_for(Nanoseconds(5));
        assert_eq!(clock.now(), Nanoseconds(55));
    }

    #[test]
    fn stepped_sleep_waits_for_advance() {
        let clock = Arc::new(ManualClock::stepped(Nanoseconds(0)));

        let sleeper = {
            let clock = clock.clone();
            thread::spawn(move || {
                clock.sleep_until(Nanoseconds(100));
                clock.now()
            })
        };

        clock.advance(Nanoseconds(40));
        clock.advance(Nanoseconds(70));

        assert_eq!(sleeper.join().unwrap(), Nanoseconds(110));
    }
}
