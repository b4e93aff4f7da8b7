//! Circuit breaker and retry
//!
//! Every remote adapter call runs as `breaker.guard(retry(op))`: the breaker
//! fast-fails while a provider is known-bad, the retry loop absorbs transient
//! failures with exponential backoff and jitter. One breaker per model.

use super::ProviderError;
use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Breaker states. HALF_OPEN allows a single probe through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Per-model circuit breaker. Failure threshold default 5, reset timeout 60s.
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_limits(name, 5, Duration::from_secs(60))
    }

    pub fn with_limits(name: &'static str, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().map(|i| i.state).unwrap_or(CircuitState::Open)
    }

    /// Gate a request. OPEN fails fast until the reset timeout elapses, then
    /// the breaker half-opens for a single probe.
    fn admit(&self) -> Result<(), ProviderError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ProviderError::CircuitOpen(self.name))?;
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed() >= self.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                inner.state = CircuitState::HalfOpen;
                tracing::info!("[{}] circuit HALF_OPEN, probing", self.name);
            } else {
                return Err(ProviderError::CircuitOpen(self.name));
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == CircuitState::HalfOpen {
                tracing::info!("[{}] circuit CLOSED, service recovered", self.name);
            }
            inner.state = CircuitState::Closed;
            inner.failures = 0;
        }
    }

    fn on_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures += 1;
            inner.last_failure = Some(Instant::now());
            if inner.state == CircuitState::HalfOpen || inner.failures >= self.failure_threshold {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    "[{}] circuit OPEN after {} failures",
                    self.name,
                    inner.failures
                );
            }
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Exponential backoff policy: `base * factor^attempt` with +-jitter, bounded
/// by `max_elapsed` across all attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let jittered = base * (1.0 + rand::rng().random_range(-self.jitter..=self.jitter));
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retry an operation under the policy. Non-retryable errors (auth) and the
/// elapsed-time cap abort immediately.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.retryable() || attempt >= policy.retries {
                    return Err(e);
                }
                if start.elapsed() >= policy.max_elapsed {
                    tracing::warn!("[retry] elapsed cap hit after {attempt} attempts: {e}");
                    return Err(e);
                }
                tracing::warn!(
                    "[retry] attempt {}/{} failed: {e}",
                    attempt + 1,
                    policy.retries
                );
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Combined breaker + retry wrapper used by every remote adapter. The breaker
/// counts the retry-wrapped operation as one outcome.
pub async fn with_resilience<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: RetryPolicy,
    op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    breaker.admit()?;
    match retry(policy, op).await {
        Ok(v) => {
            breaker.on_success();
            Ok(v)
        }
        Err(e) => {
            breaker.on_failure();
            Err(e)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> ProviderError {
        ProviderError::Api {
            provider: "test",
            code: ErrorCode::ServerError,
            message: "boom".into(),
            retryable: true,
        }
    }

    fn auth_error() -> ProviderError {
        ProviderError::Api {
            provider: "test",
            code: ErrorCode::AuthError,
            message: "denied".into(),
            retryable: false,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            retries: 3,
            base_delay: Duration::from_millis(1),
            factor: 1.0,
            jitter: 0.0,
            max_elapsed: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry(fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(server_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_skips_auth_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = retry(fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(auth_error()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_half_opens() {
        let breaker = CircuitBreaker::with_limits("test", 2, Duration::from_millis(20));
        let policy = RetryPolicy {
            retries: 0,
            ..fast_policy()
        };

        for _ in 0..2 {
            let _ = with_resilience(&breaker, policy, || async { Err::<(), _>(server_error()) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // While open: fast fail without invoking the op
        let calls = AtomicU32::new(0);
        let r = with_resilience(&breaker, policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(1) }
        })
        .await;
        assert!(matches!(r, Err(ProviderError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // After the reset timeout the probe goes through and closes it
        tokio::time::sleep(Duration::from_millis(25)).await;
        let r = with_resilience(&breaker, policy, || async { Ok::<_, ProviderError>(7) }).await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_limits("test", 1, Duration::from_millis(10));
        let policy = RetryPolicy {
            retries: 0,
            ..fast_policy()
        };
        let _ = with_resilience(&breaker, policy, || async { Err::<(), _>(server_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(12)).await;
        let _ = with_resilience(&breaker, policy, || async { Err::<(), _>(server_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
