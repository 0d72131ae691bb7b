//! Resilience patterns for the ESI client.
//!
//! ESI enforces a rolling error budget shared by every caller of an
//! application. [`ThrottleGuard`] turns the budget headers into a flag in the
//! shared store that blocks all clients until the budget resets, and
//! [`RetryController`] retries transient failures with a fixed delay.

use crate::classify::ResponseSignals;
use crate::config::ClientPolicy;
use crate::errors::{Attempt, EsiError, EsiErrorKind, EsiResult, RequestResult};
use crate::observability::Metrics;
use crate::store::CacheStore;
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Store key of the shared throttle flag.
pub const THROTTLE_KEY: &str = "BLOCK_ESI_REQUESTS";

/// Error budget ESI grants per window.
pub const FULL_ERROR_BUDGET: u32 = 100;

/// Block duration used when ESI omits the reset header.
const FALLBACK_RESET_SECS: u64 = 60;

/// Longest block a single reset header can impose.
const MAX_RESET_SECS: u64 = 3600;

/// Runs `future` to completion, or returns [`EsiError::Cancelled`] as soon as the token fires.
pub(crate) async fn run_cancellable<F: Future>(
    cancellation: Option<&CancellationToken>,
    future: F,
) -> EsiResult<F::Output> {
    match cancellation {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(EsiError::Cancelled),
                output = future => Ok(output),
            }
        }
        None => Ok(future.await),
    }
}

/// Sleeps for `duration` unless cancelled first.
pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    cancellation: Option<&CancellationToken>,
) -> EsiResult<()> {
    run_cancellable(cancellation, sleep(duration)).await
}

/// Unix-millisecond clock that advances with tokio's clock.
#[derive(Debug, Clone, Copy)]
struct WallClock {
    anchor_unix_ms: i64,
    anchor: Instant,
}

impl WallClock {
    fn new() -> Self {
        Self {
            anchor_unix_ms: Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }

    fn now_unix_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_unix_ms.saturating_add(elapsed)
    }
}

/// Process-wide circuit breaker driven by ESI's error budget headers.
///
/// The shared flag holds the unix-millisecond deadline at which the budget
/// resets, so a caller arriving late in the window only waits for what is left.
pub struct ThrottleGuard {
    store: Arc<dyn CacheStore>,
    threshold: u32,
    metrics: Arc<Metrics>,
    clock: WallClock,
}

impl ThrottleGuard {
    /// Creates a guard that trips when fewer than `threshold` errors remain.
    pub fn new(store: Arc<dyn CacheStore>, threshold: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            threshold,
            metrics,
            clock: WallClock::new(),
        }
    }

    /// Suspends the caller while the shared throttle flag is set.
    pub async fn block_if_active(&self, cancellation: Option<&CancellationToken>) -> EsiResult<()> {
        let Some(flag) = self.store.get(THROTTLE_KEY).await? else {
            return Ok(());
        };

        let wait = match flag.as_i64() {
            Some(deadline_ms) => {
                let remaining_ms = deadline_ms.saturating_sub(self.clock.now_unix_ms()).max(0);
                Duration::from_millis(remaining_ms.unsigned_abs())
            }
            None => Duration::from_secs(FALLBACK_RESET_SECS),
        };
        if wait.is_zero() {
            return Ok(());
        }

        tracing::warn!(wait_ms = wait.as_millis() as u64, "Blocking ESI call while error budget recovers");
        self.metrics.record_throttled();
        sleep_or_cancel(wait, cancellation).await
    }

    /// Inspects budget headers and sets the shared flag when the budget runs low.
    ///
    /// Returns true if the flag was set.
    pub async fn record(&self, signals: &ResponseSignals, endpoint: &str) -> EsiResult<bool> {
        let Some(remaining) = signals.error_limit_remain else {
            return Ok(false);
        };

        if remaining < self.threshold {
            let wait_secs = signals
                .error_limit_reset
                .unwrap_or(FALLBACK_RESET_SECS)
                .min(MAX_RESET_SECS);
            let deadline_ms = self
                .clock
                .now_unix_ms()
                .saturating_add(i64::try_from(wait_secs * 1000).unwrap_or(i64::MAX));
            tracing::warn!(
                remaining = remaining,
                endpoint = endpoint,
                wait_secs = wait_secs,
                "ESI error allowance low, blocking ESI requests"
            );
            self.store
                .set(
                    THROTTLE_KEY,
                    json!(deadline_ms),
                    Duration::from_secs(wait_secs.saturating_add(1)),
                )
                .await?;
            return Ok(true);
        }

        if remaining != FULL_ERROR_BUDGET {
            tracing::info!(remaining = remaining, "ESI error allowance");
        }
        Ok(false)
    }
}

/// States of one logical request under the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No attempt finished yet.
    Pending,
    /// The last attempt failed with a retryable kind.
    Retrying {
        /// Attempts left.
        remaining: u32,
    },
    /// An attempt succeeded.
    Success,
    /// A non-retryable failure, or retries exhausted.
    Failed,
}

fn transition(endpoint: &str, from: RetryState, to: RetryState) -> RetryState {
    tracing::trace!(endpoint = endpoint, from = ?from, to = ?to, "Retry state transition");
    to
}

/// Bounded retry with a fixed delay.
pub struct RetryController {
    max_retries: u32,
    retry_delay: Duration,
    metrics: Arc<Metrics>,
}

impl RetryController {
    /// Creates a controller allowing `max_retries` attempts in total.
    pub fn new(max_retries: u32, retry_delay: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
            metrics,
        }
    }

    /// Runs `attempt` until it succeeds, fails permanently or exhausts its attempts.
    ///
    /// Faults returned by `attempt` propagate immediately. Cancellation is
    /// checked before every attempt and interrupts the inter-attempt delay.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        endpoint: &str,
        cancellation: Option<&CancellationToken>,
        mut attempt: F,
    ) -> EsiResult<Attempt<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EsiResult<Attempt<T>>>,
    {
        let mut state = RetryState::Pending;
        let mut remaining = self.max_retries;

        loop {
            if cancellation.map_or(false, CancellationToken::is_cancelled) {
                return Err(EsiError::Cancelled);
            }

            let failure = match attempt().await? {
                Ok(value) => {
                    transition(endpoint, state, RetryState::Success);
                    return Ok(Ok(value));
                }
                Err(failure) => failure,
            };

            remaining -= 1;
            if !failure.kind.is_retryable() || remaining == 0 {
                transition(endpoint, state, RetryState::Failed);
                if failure.kind.is_retryable() {
                    tracing::warn!(endpoint = endpoint, kind = %failure.kind, "Retries exhausted");
                }
                return Ok(Err(failure));
            }

            state = transition(endpoint, state, RetryState::Retrying { remaining });
            tracing::warn!(
                endpoint = endpoint,
                kind = %failure.kind,
                retries_remaining = remaining,
                "Retrying request after error"
            );
            self.metrics.record_retry();
            sleep_or_cancel(self.retry_delay, cancellation).await?;
        }
    }
}

/// Applies the caller's raise/return policy to a finished request.
pub fn apply_terminal_policy(
    policy: &ClientPolicy,
    endpoint: &str,
    result: RequestResult,
) -> EsiResult<RequestResult> {
    match result {
        RequestResult::Failure { kind, payload } => {
            let raise = if kind == EsiErrorKind::UpstreamApplicationError {
                policy.raise_application_errors
            } else {
                policy.raise_other_errors
            };
            if raise {
                Err(EsiError::upstream(kind, endpoint, payload))
            } else {
                Ok(RequestResult::Failure { kind, payload })
            }
        }
        success => Ok(success),
    }
}
