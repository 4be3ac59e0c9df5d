//! Transfer-rate estimation over a trailing ten-second window.

use std::time::{Duration, Instant};

/// Width of the rolling window in seconds.
const WINDOW_SECS: usize = 10;

/// Rolling-window speed estimator.
///
/// Keeps one byte-count bucket per wall-clock second for the trailing
/// [`WINDOW_SECS`] seconds. The average is taken over the seconds
/// observed so far, so the estimate is usable before the window has
/// warmed up. Zero-length keep-alive events advance the window without
/// contributing bytes.
pub struct RateEstimator {
    buckets: [u64; WINDOW_SECS],
    head: usize,
    current_second: u64,
    populated: usize,
    origin: Instant,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            buckets: [0; WINDOW_SECS],
            head: 0,
            current_second: 0,
            populated: 0,
            origin: Instant::now(),
        }
    }

    /// Records `bytes` against the current wall-clock second.
    pub fn record(&mut self, bytes: u64) {
        let second = self.origin.elapsed().as_secs();
        self.record_at(second, bytes);
    }

    /// Advances the window without adding bytes (transport keep-alive).
    pub fn touch(&mut self) {
        self.record(0);
    }

    /// Clock-explicit recording path; `second` is monotonic seconds since
    /// the estimator's origin.
    fn record_at(&mut self, second: u64, bytes: u64) {
        if self.populated == 0 {
            self.current_second = second;
            self.populated = 1;
        } else if second > self.current_second {
            let elapsed = second - self.current_second;
            let advance = elapsed.min(WINDOW_SECS as u64) as usize;
            for _ in 0..advance {
                self.head = (self.head + 1) % WINDOW_SECS;
                self.buckets[self.head] = 0;
            }
            self.populated = (self.populated + advance).min(WINDOW_SECS);
            self.current_second = second;
        }
        self.buckets[self.head] += bytes;
    }

    /// Average bytes per second over the observed part of the window.
    pub fn bytes_per_second(&self) -> u64 {
        if self.populated == 0 {
            return 0;
        }
        let total: u64 = self.buckets.iter().sum();
        total / self.populated as u64
    }

    /// Time to move `remaining` more bytes at the current rate, or `None`
    /// when the rate is zero.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        if rate == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate as f64))
    }

    /// Discards all samples, e.g. when a transfer is resumed after an
    /// interruption.
    pub fn reset(&mut self) {
        self.buckets = [0; WINDOW_SECS];
        self.head = 0;
        self.current_second = 0;
        self.populated = 0;
        self.origin = Instant::now();
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}
