use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling from `min_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_backoff
            .saturating_mul(factor)
            .clamp(self.min_backoff, self.max_backoff.max(self.min_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting trial calls.
    pub open_timeout: Duration,
    /// Quiet period after which the consecutive-failure count starts over.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOptions {
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub batch_size: usize,
    pub max_concurrent_requests: usize,
    pub retry: RetryPolicy,
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    pub rate_limit: Option<RateLimitOptions>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            batch_size: 10,
            max_concurrent_requests: 100,
            retry: RetryPolicy::default(),
            circuit_breaker: None,
            rate_limit: None,
        }
    }
}
