//! Retry policy for transport calls.
//!
//! Whether to retry is decided from the error kind and the attempt number
//! alone. Only the delay carries jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use televault_transport::{ErrorKind, RemoteTransport, TransportError, TransportFuture};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff with a bounded attempt count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Backoff cap.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Timeout applied to each individual attempt.
    #[serde(rename = "attempt_timeout_ms", with = "millis")]
    pub attempt_timeout: Duration,
    /// Spread delays by ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Backoff delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }

    /// Decides whether failed attempt `attempt` (1-based) is retried.
    ///
    /// Only transient failures are retried. A server-requested delay is
    /// honored when it exceeds the backoff.
    pub fn decide(
        &self,
        kind: ErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if kind != ErrorKind::Transient || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let backoff = self.delay_for_attempt(attempt);
        RetryDecision::Retry(retry_after.map_or(backoff, |r| r.max(backoff)))
    }
}

/// Runs `op` until it succeeds, fails fatally, or attempts run out.
///
/// Each attempt waits for the transport's rate-limit slot first and is
/// bounded by `attempt_timeout`. Cancellation interrupts slot waits and
/// backoff sleeps but never an attempt in progress.
pub(crate) async fn with_retry<'a, T, F>(
    policy: &RetryPolicy,
    transport: &dyn RemoteTransport,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> TransportFuture<'a, T>,
{
    let mut attempt = 1;
    loop {
        let slot = transport.next_available_slot();
        if !slot.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(slot) => {}
                _ = cancel.cancelled() => {
                    return Err(TransportError::transient(format!(
                        "{what}: cancelled while waiting {slot:?} for a rate-limit slot"
                    )));
                }
            }
        }

        let err = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => TransportError::transient(format!(
                "attempt timed out after {:?}",
                policy.attempt_timeout
            )),
        };

        match policy.decide(err.kind(), attempt, err.retry_after()) {
            RetryDecision::GiveUp => return Err(err),
            RetryDecision::Retry(delay) => {
                warn!(op = what, attempt, ?delay, error = %err, "transport call failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use televault_transport::MemoryTransport;
    use televault_types::RemoteLocator;

    fn fixed() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.initial_delay, Duration::from_millis(500));
        assert_eq!(p.max_delay, Duration::from_secs(30));
        assert!((p.backoff_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = fixed();
        let expected = [0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0];
        for (i, &secs) in expected.iter().enumerate() {
            assert_eq!(
                p.delay_for_attempt(i as u32 + 1),
                Duration::from_secs_f64(secs),
                "attempt {}",
                i + 1
            );
        }
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let p = RetryPolicy::default();
        for attempt in 1..=6 {
            let base = fixed().delay_for_attempt(attempt).as_secs_f64();
            let got = p.delay_for_attempt(attempt).as_secs_f64();
            assert!(got >= base * 0.74 && got <= base * 1.26, "{got} vs {base}");
        }
    }

    #[test]
    fn only_transient_is_retried() {
        let p = fixed();
        assert!(matches!(
            p.decide(ErrorKind::Transient, 1, None),
            RetryDecision::Retry(_)
        ));
        for kind in [
            ErrorKind::PayloadTooLarge,
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
        ] {
            assert_eq!(p.decide(kind, 1, None), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let p = fixed();
        assert!(matches!(
            p.decide(ErrorKind::Transient, 4, None),
            RetryDecision::Retry(_)
        ));
        assert_eq!(p.decide(ErrorKind::Transient, 5, None), RetryDecision::GiveUp);
    }

    #[test]
    fn retry_after_extends_delay() {
        let p = fixed();
        assert_eq!(
            p.decide(ErrorKind::Transient, 1, Some(Duration::from_secs(9))),
            RetryDecision::Retry(Duration::from_secs(9))
        );
        // A shorter hint does not shrink the backoff.
        assert_eq!(
            p.decide(ErrorKind::Transient, 3, Some(Duration::from_millis(1))),
            RetryDecision::Retry(Duration::from_secs(2))
        );
    }

    #[test]
    fn policy_toml_uses_millis() {
        let json = serde_json::to_value(fixed()).unwrap();
        assert_eq!(json["initial_delay_ms"], 500);
        assert_eq!(json["attempt_timeout_ms"], 60_000);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, fixed());
    }

    #[tokio::test]
    async fn with_retry_recovers_from_transient() {
        let t = MemoryTransport::new();
        t.fail_next_puts(2, TransportError::transient("blip"));
        let d = televault_types::Digest::from_bytes([1; 32]);
        let cancel = CancellationToken::new();

        let loc: RemoteLocator = with_retry(&fast(), &t, &cancel, "put", || t.put(&d, b"x"))
            .await
            .unwrap();
        assert_eq!(loc.digest, d);
        assert_eq!(t.put_calls(), 3);
    }

    #[tokio::test]
    async fn with_retry_stops_on_fatal() {
        let t = MemoryTransport::new();
        t.fail_next_puts(1, TransportError::Unauthorized("bad token".into()));
        let d = televault_types::Digest::from_bytes([1; 32]);
        let cancel = CancellationToken::new();

        let err = with_retry(&fast(), &t, &cancel, "put", || t.put(&d, b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(t.put_calls(), 1);
    }

    #[tokio::test]
    async fn with_retry_exhausts_attempts() {
        let t = MemoryTransport::new();
        t.fail_next_puts(10, TransportError::transient("down"));
        let d = televault_types::Digest::from_bytes([1; 32]);
        let cancel = CancellationToken::new();

        let err = with_retry(&fast(), &t, &cancel, "put", || t.put(&d, b"x"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(t.put_calls(), 5);
    }

    #[tokio::test]
    async fn with_retry_times_out_slow_attempts() {
        let t = MemoryTransport::new().with_latency(Duration::from_millis(200));
        let d = televault_types::Digest::from_bytes([1; 32]);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(10),
            ..fast()
        };

        let err = with_retry(&policy, &t, &cancel, "put", || t.put(&d, b"x"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(t.put_calls(), 2);
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff() {
        let t = MemoryTransport::new();
        t.fail_next_puts(10, TransportError::transient("down"));
        let d = televault_types::Digest::from_bytes([1; 32]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            jitter: false,
            ..RetryPolicy::default()
        };

        let calls = AtomicU32::new(0);
        let err = with_retry(&policy, &t, &cancel, "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            t.put(&d, b"x")
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_interrupts_rate_limit_wait() {
        let t = MemoryTransport::new().with_rate_limit(1, Duration::from_secs(60));
        let d = televault_types::Digest::from_bytes([1; 32]);
        t.put(&d, b"x").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = with_retry(&RetryPolicy::default(), &t, &cancel, "put", || {
            t.put(&d, b"y")
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(t.put_calls(), 1);
    }
}
