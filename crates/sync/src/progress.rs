//! Transfer rate over a trailing time window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default averaging window.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(5);

/// Measures throughput from a job's running byte total.
///
/// Callers report the cumulative number of bytes moved so far; the meter
/// keeps `(instant, total)` marks for the last `window` plus one older mark
/// as the baseline, so the rate covers the whole window even when chunks
/// complete in bursts.
pub struct RateMeter {
    window: Duration,
    marks: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(VecDeque::new()),
        }
    }

    /// Records that `total` bytes have been moved as of now.
    pub fn record(&self, total: u64) {
        self.record_at(Instant::now(), total);
    }

    fn record_at(&self, now: Instant, total: u64) {
        let mut marks = self.marks.lock().unwrap();
        marks.push_back((now, total));
        // Drop marks once the next one is also outside the window.
        while marks.len() > 2 && now.duration_since(marks[1].0) > self.window {
            marks.pop_front();
        }
    }

    /// Bytes per second across the window; 0.0 until two marks exist.
    pub fn bytes_per_second(&self) -> f64 {
        let marks = self.marks.lock().unwrap();
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (marks.front(), marks.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(t0);
        if elapsed.is_zero() {
            return 0.0;
        }
        b1.saturating_sub(b0) as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }
}
