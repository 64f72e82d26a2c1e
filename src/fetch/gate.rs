//! Politeness gate: randomized delay between outbound requests.
//!
//! The crawler targets a single source site, so the gate serializes all
//! outbound requests and sleeps a uniformly random duration between them.
//! One delay window applies per request, including retries.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use finncrawl_core::fetch::PolitenessGate;
//!
//! # async fn example() {
//! let gate = PolitenessGate::new(Duration::from_secs(1), Duration::from_secs(3));
//!
//! // First request proceeds immediately
//! gate.acquire().await;
//!
//! // Subsequent requests wait 1-3 seconds measured from the previous one
//! gate.acquire().await;
//! # }
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Randomized per-request delay gate.
///
/// Designed to be owned by the fetcher and shared behind `Arc` when the
/// same gate must cover several components. The inner mutex also serializes
/// requests, so two callers can never fetch concurrently through one gate.
#[derive(Debug)]
pub struct PolitenessGate {
    /// Lower bound of the random delay.
    min_delay: Duration,

    /// Upper bound of the random delay.
    max_delay: Duration,

    /// Whether the gate is disabled (for `--delay-min-ms 0` and tests).
    disabled: bool,

    /// Completion time of the previous request.
    /// `None` means no request has been made yet (first request is immediate).
    last_request: Mutex<Option<Instant>>,
}

impl PolitenessGate {
    /// Creates a gate sleeping a random duration in `[min_delay, max_delay]`
    /// between consecutive requests.
    ///
    /// If `max_delay < min_delay` the bounds are swapped.
    #[must_use]
    #[instrument(skip_all, fields(min_ms = min_delay.as_millis(), max_ms = max_delay.as_millis()))]
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        debug!("creating politeness gate");
        let (min_delay, max_delay) = if max_delay < min_delay {
            (max_delay, min_delay)
        } else {
            (min_delay, max_delay)
        };
        Self {
            min_delay,
            max_delay,
            disabled: false,
            last_request: Mutex::new(None),
        }
    }

    /// Creates a disabled gate that applies no delays.
    #[must_use]
    pub fn disabled() -> Self {
        debug!("creating disabled politeness gate");
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            disabled: true,
            last_request: Mutex::new(None),
        }
    }

    /// Returns whether the gate is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Waits for permission to make the next outbound request.
    ///
    /// The first request proceeds immediately; each subsequent request
    /// waits until a freshly sampled delay has elapsed since the previous
    /// request completed acquiring.
    #[instrument(skip(self))]
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        let mut last_request = self.last_request.lock().await;

        if let Some(last) = *last_request {
            let delay = self.sample_delay();
            let elapsed = last.elapsed();
            if elapsed < delay {
                let remaining = delay.saturating_sub(elapsed);
                debug!(delay_ms = remaining.as_millis(), "applying politeness delay");
                tokio::time::sleep(remaining).await;
            }
        } else {
            debug!("first request - no delay");
        }

        *last_request = Some(Instant::now());
    }

    /// Samples a uniform random delay in `[min_delay, max_delay]`.
    fn sample_delay(&self) -> Duration {
        if self.max_delay == self.min_delay {
            return self.min_delay;
        }
        let min_ms = u64::try_from(self.min_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_new_swaps_inverted_bounds() {
        let gate = PolitenessGate::new(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(gate.min_delay, Duration::from_secs(1));
        assert_eq!(gate.max_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_gate_disabled_flag() {
        assert!(PolitenessGate::disabled().is_disabled());
        assert!(!PolitenessGate::new(Duration::ZERO, Duration::ZERO).is_disabled());
    }

    #[test]
    fn test_sample_delay_within_bounds() {
        let gate = PolitenessGate::new(Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..100 {
            let d = gate.sample_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_sample_delay_fixed_when_bounds_equal() {
        let gate = PolitenessGate::new(Duration::from_millis(250), Duration::from_millis(250));
        assert_eq!(gate.sample_delay(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_gate_disabled_no_delay() {
        tokio::time::pause();

        let gate = PolitenessGate::disabled();
        let start = Instant::now();

        gate.acquire().await;
        gate.acquire().await;
        gate.acquire().await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_gate_first_request_no_delay() {
        tokio::time::pause();

        let gate = PolitenessGate::new(Duration::from_secs(1), Duration::from_secs(1));
        let start = Instant::now();

        gate.acquire().await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_gate_delays_subsequent_requests() {
        tokio::time::pause();

        // Equal bounds make the sampled delay deterministic
        let gate = PolitenessGate::new(Duration::from_secs(1), Duration::from_secs(1));
        let start = Instant::now();

        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));

        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
