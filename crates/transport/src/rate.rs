//! Cooperative request quota.
//!
//! The platform allows a fixed number of requests per sliding time window.
//! [`RateWindow`] does no queueing itself: callers ask for
//! [`next_available_slot`](RateWindow::next_available_slot), sleep that
//! long, then record their request. Asking claims the slot, so concurrent
//! callers are handed successive slots instead of the same one.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window request quota.
pub struct RateWindow {
    quota: usize,
    window: Duration,
    inner: Mutex<WindowInner>,
}

struct WindowInner {
    sent: VecDeque<Instant>,
    /// Slots handed out by `next_available_slot` and not yet recorded.
    claimed: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RateWindow {
    /// Allows `quota` requests per `window`. A zero quota disables limiting.
    pub fn new(quota: usize, window: Duration) -> Self {
        Self {
            quota,
            window,
            inner: Mutex::new(WindowInner {
                sent: VecDeque::new(),
                claimed: VecDeque::new(),
                blocked_until: None,
            }),
        }
    }

    /// A window that never delays.
    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Records a request issued now, redeeming the oldest claimed slot.
    pub fn record(&self) {
        if self.quota == 0 {
            return;
        }
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        prune(&mut s.sent, now, self.window);
        s.claimed.pop_front();
        s.sent.push_back(now);
    }

    /// Blocks new requests for `delay` (server-side rate-limit response).
    pub fn penalize(&self, delay: Duration) {
        let mut s = self.inner.lock().unwrap();
        let until = Instant::now() + delay;
        s.blocked_until = Some(s.blocked_until.map_or(until, |b| b.max(until)));
    }

    /// Claims the next free slot and returns how long to wait for it.
    ///
    /// A claim counts against the quota until it is recorded or ages out of
    /// the window.
    pub fn next_available_slot(&self) -> Duration {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();

        let penalty = s
            .blocked_until
            .map(|b| b.saturating_duration_since(now))
            .unwrap_or_default();
        if penalty.is_zero() {
            s.blocked_until = None;
        }

        if self.quota == 0 {
            return penalty;
        }

        prune(&mut s.sent, now, self.window);
        let window = self.window;
        s.claimed.retain(|&c| c > now || now.duration_since(c) < window);

        let mut taken: Vec<Instant> = s.sent.iter().chain(&s.claimed).copied().collect();
        let quota_wait = if taken.len() < self.quota {
            Duration::ZERO
        } else {
            // The slot frees up when enough of the oldest entries age out.
            taken.sort_unstable();
            let idx = taken.len() - self.quota;
            (taken[idx] + self.window).saturating_duration_since(now)
        };

        let wait = penalty.max(quota_wait);
        s.claimed.push_back(now + wait);
        wait
    }
}

fn prune(sent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = sent.front() {
        if now.duration_since(front) >= window {
            sent.pop_front();
        } else {
            break;
        }
    }
}
