//! Retry budgets, backoff series, and the component circuit breaker.
//!
//! Transient subtask failures retry on a bounded exponential series
//! (base 10 s, doubled, capped at 60 s, three attempts). Optimistic-lock
//! conflicts on task rows retry on a much shorter series (100/200/400 ms).
//! Infrastructure failures open a per-component circuit breaker for a
//! cool-down interval.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Backoff delay for the given attempt (0-based) on the subtask retry
/// series: `base * 2^attempt`, capped.
pub fn subtask_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(cap)
}

/// Backoff delay for the given attempt (0-based) on the version-conflict
/// series: 100 ms, 200 ms, 400 ms.
pub fn conflict_backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * 2u64.saturating_pow(attempt))
}

/// Number of attempts allowed for version-conflict retries.
pub const CONFLICT_MAX_ATTEMPTS: u32 = 3;

/// Consecutive failures before a component circuit breaker opens.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;

/// Cool-down before an open breaker probes half-open again.
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Run an optimistically-locked operation, retrying version conflicts.
///
/// The operation reports a conflict by returning `Ok(false)`; any `Ok(true)`
/// or `Err` is final. Returns whether the operation eventually succeeded.
pub async fn with_conflict_retry<F, Fut, E>(mut op: F) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    for attempt in 0..CONFLICT_MAX_ATTEMPTS {
        if op().await? {
            return Ok(true);
        }
        tokio::time::sleep(conflict_backoff(attempt)).await;
    }
    op().await
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// A per-component circuit breaker.
///
/// Consecutive failures past the threshold open the breaker for the
/// cool-down interval; the first call after cool-down probes half-open.
/// A success closes it, a failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// once the cool-down has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: closes the breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.state = BreakerState::Closed;
    }

    /// Record a failed call: opens the breaker when the consecutive-failure
    /// threshold is reached, or immediately from half-open.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        let reopen = matches!(inner.state, BreakerState::HalfOpen)
            || inner.consecutive_failures >= self.threshold;
        if reopen {
            inner.state = BreakerState::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }

    /// Whether the breaker is currently refusing calls.
    pub fn is_open(&self) -> bool {
        !self.allow()
    }
}
