use std::time::{Duration, Instant};

use prometheus::Histogram;

/// Latency guard: observes the elapsed time in microseconds when dropped.
pub struct Tracker {
    start: Instant,
    hist: Histogram,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "Tracker<start={:?}>", self.start)
    }
}

impl Tracker {
    pub fn new(hist: Histogram) -> Tracker {
        Self {
            start: Instant::now(),
            hist,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.hist.observe(self.start.elapsed().as_secs_f64() * 1_000_000.0);
    }
}
