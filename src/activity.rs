//! Monotonic "time since last observed traffic" measurement

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A resettable monotonic clock fed by traffic events.
///
/// `mark` is called by the listeners and copiers whenever bytes move;
/// the inactivity timer reads `elapsed` to decide whether the container
/// group should be suspended. Wall-clock jumps have no effect.
pub struct ActivityClock {
    last_mark: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last_mark: Mutex::new(Instant::now()),
        }
    }

    /// Record activity now.
    pub fn mark(&self) {
        *self.last_mark.lock() = Instant::now();
    }

    /// Time since the last mark.
    pub fn elapsed(&self) -> Duration {
        self.last_mark.lock().elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_grows_until_marked() {
        let clock = ActivityClock::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.elapsed() >= Duration::from_millis(20));

        clock.mark();
        assert!(clock.elapsed() < Duration::from_millis(20));
    }
}
