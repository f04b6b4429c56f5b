use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::Quota;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// **Request pacing for the portal**
///
/// Enforces the single politeness knob of the crawler: a minimum spacing of
/// `rate_limit_ms` between consecutive outbound requests on a worker path.
/// A zero interval disables pacing (used by tests and local mirrors).
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    interval: Duration,
}

impl RateLimiter {
    /// Create a limiter releasing one permit every `rate_limit_ms`.
    pub fn from_millis(rate_limit_ms: u64) -> Self {
        let interval = Duration::from_millis(rate_limit_ms);
        let limiter = Quota::with_period(interval)
            .map(|quota| Arc::new(governor::RateLimiter::direct(quota)));
        if limiter.is_none() {
            debug!("Rate limiting disabled (interval of zero)");
        }
        Self { limiter, interval }
    }

    /// Wait until the next request is allowed.
    ///
    /// Called immediately before every outbound request on the paced path.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// The configured minimum spacing.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn spacing_is_enforced() {
        let limiter = RateLimiter::from_millis(50);

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = start.elapsed();

        // Three permits at 50 ms spacing: the second and third must wait.
        assert!(elapsed >= Duration::from_millis(90), "elapsed: {elapsed:?}");
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let limiter = RateLimiter::from_millis(0);

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn shared_across_workers() {
        let limiter = RateLimiter::from_millis(30);
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // Four permits through one shared limiter take at least three periods.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
