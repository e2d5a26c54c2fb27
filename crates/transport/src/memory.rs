//! In-process transport with call counting and fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use televault_types::{Digest, RemoteLocator};
use tracing::trace;

use crate::rate::RateWindow;
use crate::{RemoteTransport, TransportError, TransportFuture};

/// Default payload ceiling, matching the Bot API download limit.
const DEFAULT_MAX_PAYLOAD: usize = 20 * 1024 * 1024;

/// Stores blobs in a map. Every failure mode of a real transport can be
/// scripted, and every call is counted.
pub struct MemoryTransport {
    inner: Mutex<MemoryInner>,
    max_payload: usize,
    latency: Option<Duration>,
    rate: RateWindow,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct MemoryInner {
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
    put_failures: VecDeque<TransportError>,
    get_failures: VecDeque<TransportError>,
    /// Successful puts allowed before every further put fails.
    put_budget: Option<(usize, TransportError)>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                blobs: HashMap::new(),
                next_id: 1,
                put_failures: VecDeque::new(),
                get_failures: VecDeque::new(),
                put_budget: None,
            }),
            max_payload: DEFAULT_MAX_PAYLOAD,
            latency: None,
            rate: RateWindow::unlimited(),
            put_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Rejects payloads larger than `limit` with `PayloadTooLarge`.
    pub fn with_max_payload(mut self, limit: usize) -> Self {
        self.max_payload = limit;
        self
    }

    /// Makes every call take at least `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Applies a request quota to the `next_available_slot` hint.
    pub fn with_rate_limit(mut self, quota: usize, window: Duration) -> Self {
        self.rate = RateWindow::new(quota, window);
        self
    }

    /// The next `n` puts fail with `error`.
    pub fn fail_next_puts(&self, n: usize, error: TransportError) {
        let mut s = self.inner.lock().unwrap();
        s.put_failures.extend(std::iter::repeat_n(error, n));
    }

    /// The next `n` gets fail with `error`.
    pub fn fail_next_gets(&self, n: usize, error: TransportError) {
        let mut s = self.inner.lock().unwrap();
        s.get_failures.extend(std::iter::repeat_n(error, n));
    }

    /// After `successes` more successful puts, every put fails with `error`.
    pub fn fail_puts_after(&self, successes: usize, error: TransportError) {
        let mut s = self.inner.lock().unwrap();
        s.put_budget = Some((successes, error));
    }

    /// Removes any put budget set by [`fail_puts_after`](Self::fail_puts_after).
    pub fn clear_put_budget(&self) {
        let mut s = self.inner.lock().unwrap();
        s.put_budget = None;
    }

    /// Flips one byte of the stored payload. Returns `false` if absent or empty.
    pub fn corrupt(&self, locator: &RemoteLocator) -> bool {
        let mut s = self.inner.lock().unwrap();
        match s.blobs.get_mut(&locator.address) {
            Some(blob) if !blob.is_empty() => {
                let mid = blob.len() / 2;
                blob[mid] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    /// Number of `put` invocations, failed ones included.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Zeroes call counters; stored blobs are kept.
    pub fn reset_counters(&self) {
        self.put_calls.store(0, Ordering::SeqCst);
        self.get_calls.store(0, Ordering::SeqCst);
        self.delete_calls.store(0, Ordering::SeqCst);
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.inner.lock().unwrap().blobs.len()
    }

    pub fn contains(&self, locator: &RemoteLocator) -> bool {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .contains_key(&locator.address)
    }

    async fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.rate.record();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlightGuard(&self.in_flight)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteTransport for MemoryTransport {
    fn put<'a>(
        &'a self,
        digest: &'a Digest,
        payload: &'a [u8],
    ) -> TransportFuture<'a, RemoteLocator> {
        Box::pin(async move {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            let _guard = self.enter().await;

            if payload.len() > self.max_payload {
                return Err(TransportError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.max_payload,
                });
            }

            let mut s = self.inner.lock().unwrap();
            if let Some(err) = s.put_failures.pop_front() {
                return Err(err);
            }
            if let Some((remaining, err)) = s.put_budget.as_mut() {
                if *remaining == 0 {
                    return Err(err.clone());
                }
                *remaining -= 1;
            }

            let address = format!("mem-{}", s.next_id);
            s.next_id += 1;
            s.blobs.insert(address.clone(), payload.to_vec());
            trace!(%address, digest = %digest.short(), bytes = payload.len(), "stored blob");
            Ok(RemoteLocator::new(*digest, address))
        })
    }

    fn get<'a>(&'a self, locator: &'a RemoteLocator) -> TransportFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let _guard = self.enter().await;

            let mut s = self.inner.lock().unwrap();
            if let Some(err) = s.get_failures.pop_front() {
                return Err(err);
            }
            s.blobs
                .get(&locator.address)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(locator.address.clone()))
        })
    }

    fn delete<'a>(&'a self, locator: &'a RemoteLocator) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let _guard = self.enter().await;

            let mut s = self.inner.lock().unwrap();
            s.blobs
                .remove(&locator.address)
                .map(|_| ())
                .ok_or_else(|| TransportError::NotFound(locator.address.clone()))
        })
    }

    fn next_available_slot(&self) -> Duration {
        self.rate.next_available_slot()
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }
}
