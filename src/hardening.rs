use crate::types::{ObservedError, RelayError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    tracing::warn!(
                        "Upstream connect failed (attempt {}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        // ±25% jitter
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }
}

/// Only failures to reach the analysis API are retried. Once it has answered,
/// whatever it said is final.
fn is_retryable(err: &ObservedError) -> bool {
    matches!(
        err.inner,
        RelayError::UpstreamUnavailable { .. } | RelayError::Network(_)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
    /// When the outstanding half-open trial request was admitted.
    trial_started: Arc<RwLock<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
            trial_started: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Fails fast with `UpstreamUnavailable` while open. Once the recovery
    /// timeout has elapsed the breaker goes half-open and admits exactly one
    /// trial request; everyone else keeps failing fast until that request
    /// reports back through `record_success` or `record_failure`. A trial that
    /// never reports back (its caller went away) is given up on after another
    /// recovery timeout.
    pub async fn check(&self, url: &str) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::Closed => return Ok(()),
            CircuitState::HalfOpen => {
                let mut trial = self.trial_started.write().await;
                let outstanding = matches!(
                    *trial,
                    Some(started) if started.elapsed() <= self.recovery_timeout
                );
                if !outstanding {
                    *trial = Some(Instant::now());
                    return Ok(());
                }
                return Err(RelayError::UpstreamUnavailable {
                    url: url.to_string(),
                    message: "circuit breaker is half-open and already testing the upstream"
                        .to_string(),
                }
                .into());
            }
            CircuitState::Open => {}
        }

        let recovered = match *self.last_failure_time.read().await {
            Some(last) => last.elapsed() > self.recovery_timeout,
            None => true,
        };
        if recovered {
            tracing::info!("Circuit breaker transitioning to HALF-OPEN");
            *state = CircuitState::HalfOpen;
            *self.trial_started.write().await = Some(Instant::now());
            return Ok(());
        }

        Err(RelayError::UpstreamUnavailable {
            url: url.to_string(),
            message: "circuit breaker is open after repeated connection failures".to_string(),
        }
        .into())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.trial_started.write().await = None;
        if *state != CircuitState::Closed {
            tracing::info!("Circuit breaker transitioning to CLOSED");
            *state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());
        *self.trial_started.write().await = None;

        let trip = *state == CircuitState::HalfOpen || failures >= self.failure_threshold;
        if trip && *state != CircuitState::Open {
            tracing::error!(
                "Circuit breaker transitioning to OPEN ({} consecutive failures)",
                failures
            );
            *state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn unavailable() -> ObservedError {
        RelayError::UpstreamUnavailable {
            url: "http://127.0.0.1:1".into(),
            message: "refused".into(),
        }
        .into()
    }

    #[tokio::test]
    async fn retries_connection_failures_until_success() {
        let policy = RetryPolicy::new(3, 1);
        let calls = AtomicUsize::new(0);
        let result = policy
            .execute_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(unavailable())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn upstream_statuses_are_never_retried() {
        let policy = RetryPolicy::new(5, 1);
        let calls = AtomicUsize::new(0);
        let result: Result<()> = policy
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RelayError::Upstream(
                        axum::http::StatusCode::BAD_GATEWAY,
                        "nope".into(),
                    )
                    .into())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, 1);
        let calls = AtomicUsize::new(0);
        let result: Result<()> = policy
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            })
            .await;
        assert!(matches!(
            result.unwrap_err().inner,
            RelayError::UpstreamUnavailable { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_opens_then_half_opens_after_recovery() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        breaker.record_failure().await;
        assert!(breaker.check("http://x").await.is_ok());
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let err = breaker.check("http://x").await.unwrap_err();
        assert!(matches!(err.inner, RelayError::UpstreamUnavailable { .. }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.check("http://x").await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(10));
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(breaker.check("http://x").await.is_ok());
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_trial_request() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut admitted = 0;
        for _ in 0..5 {
            match breaker.check("http://x").await {
                Ok(()) => admitted += 1,
                Err(e) => assert!(matches!(e.inner, RelayError::UpstreamUnavailable { .. })),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        for _ in 0..3 {
            assert!(breaker.check("http://x").await.is_ok());
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_trial_request() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_millis(10)));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.check("http://x").await.is_ok() })
            })
            .collect();
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_waits_again() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.check("http://x").await.is_ok());

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(breaker.check("http://x").await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.check("http://x").await.is_ok());
        assert!(breaker.check("http://x").await.is_err());
    }

    #[tokio::test]
    async fn abandoned_trial_is_replaced_after_recovery_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.check("http://x").await.is_ok());
        assert!(breaker.check("http://x").await.is_err());

        // The first trial never reports back.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.check("http://x").await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }
}
