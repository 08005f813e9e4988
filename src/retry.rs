//! Retry policies for activities.
//!
//! Failures are classified into an [`ActivityError`]; a [`RetryPolicy`]
//! decides from that classification, the attempt count and the elapsed
//! time whether to try again and after which delay. The runtime's worker
//! evaluates the policy after each attempt and re-enqueues the execution
//! with its retry progress; [`invoke_with_retry`] applies the same policy to
//! a plain in-process call.
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Classified activity failure. The `Display` form is what gets recorded in
/// history and can be classified again with [`ActivityError::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ActivityError {
    /// The remote work has not finished yet.
    #[error("in progress: {0}")]
    InProgress(String),
    /// The remote service asked the caller to slow down.
    #[error("throttled: {message}")]
    Throttled { message: String, retry_after_ms: Option<u64> },
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

/// Coarse failure class, recoverable from recorded error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InProgress,
    Throttled,
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn of(message: &str) -> Self {
        ActivityError::classify(message).kind()
    }
}

impl ActivityError {
    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        ActivityError::Throttled {
            message: message.into(),
            retry_after_ms: retry_after.map(crate::duration_ms),
        }
    }

    /// Rebuild an error from its display form. Text without a known prefix
    /// is permanent.
    pub fn classify(message: &str) -> Self {
        if let Some(rest) = message.strip_prefix("in progress: ") {
            ActivityError::InProgress(rest.to_string())
        } else if let Some(rest) = message.strip_prefix("throttled: ") {
            ActivityError::Throttled {
                message: rest.to_string(),
                retry_after_ms: None,
            }
        } else if let Some(rest) = message.strip_prefix("transient: ") {
            ActivityError::Transient(rest.to_string())
        } else {
            ActivityError::Permanent(message.to_string())
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ActivityError::InProgress(_) => FailureKind::InProgress,
            ActivityError::Throttled { .. } => FailureKind::Throttled,
            ActivityError::Transient(_) => FailureKind::Transient,
            ActivityError::Permanent(_) => FailureKind::Permanent,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ActivityError::Throttled {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

impl From<String> for ActivityError {
    fn from(message: String) -> Self {
        ActivityError::classify(&message)
    }
}

impl From<&str> for ActivityError {
    fn from(message: &str) -> Self {
        ActivityError::classify(message)
    }
}

/// Which failures a policy retries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    Never,
    /// Every failure, permanent ones included.
    Any,
    /// In-progress, throttled and transient failures.
    #[default]
    Transient,
    InProgress,
    Throttled,
    /// Failures whose text contains the given fragment.
    MessageContains(String),
}

impl RetryOn {
    pub fn matches(&self, err: &ActivityError) -> bool {
        match self {
            RetryOn::Never => false,
            RetryOn::Any => true,
            RetryOn::Transient => err.kind() != FailureKind::Permanent,
            RetryOn::InProgress => err.kind() == FailureKind::InProgress,
            RetryOn::Throttled => err.kind() == FailureKind::Throttled,
            RetryOn::MessageContains(fragment) => err.to_string().contains(fragment.as_str()),
        }
    }
}

fn default_backoff() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 and 1 both mean no retry.
    pub max_attempts: u32,
    pub first_retry_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_coefficient: f64,
    #[serde(default)]
    pub max_retry_delay_ms: Option<u64>,
    /// Budget measured from the first attempt.
    #[serde(default)]
    pub retry_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_on: RetryOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    AttemptsExhausted,
    TimeoutExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp { reason: GiveUpReason },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, first_retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            first_retry_delay_ms: crate::duration_ms(first_retry_delay),
            backoff_coefficient: default_backoff(),
            max_retry_delay_ms: None,
            retry_timeout_ms: None,
            retry_on: RetryOn::default(),
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO).retry_on(RetryOn::Never)
    }

    pub fn with_backoff(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_delay(mut self, max: Duration) -> Self {
        self.max_retry_delay_ms = Some(crate::duration_ms(max));
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout_ms = Some(crate::duration_ms(timeout));
        self
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Backoff after the `attempt`-th failure (1-based), before any
    /// throttling hint or timeout clamp.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.max(0.0).powi(exponent);
        let mut ms = (self.first_retry_delay_ms as f64 * factor).min(u64::MAX as f64) as u64;
        if let Some(max) = self.max_retry_delay_ms {
            ms = ms.min(max);
        }
        Duration::from_millis(ms)
    }

    pub fn evaluate(&self, err: &ActivityError, attempt: u32, elapsed: Duration) -> RetryDecision {
        if !self.retry_on.matches(err) {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable,
            };
        }
        if attempt >= self.max_attempts.max(1) {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::AttemptsExhausted,
            };
        }
        let mut delay = err.retry_after().unwrap_or_else(|| self.delay_for_attempt(attempt));
        if let Some(timeout) = self.retry_timeout_ms.map(Duration::from_millis) {
            if elapsed >= timeout {
                return RetryDecision::GiveUp {
                    reason: GiveUpReason::TimeoutExceeded,
                };
            }
            delay = delay.min(timeout - elapsed);
        }
        RetryDecision::Retry { delay }
    }
}

/// Final failure after the policy gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryExhausted {
    pub error: ActivityError,
    pub attempts: u32,
    pub reason: GiveUpReason,
}

/// Run `call` until it succeeds or `policy` gives up. Without a policy the
/// call runs once.
pub async fn invoke_with_retry<F, Fut>(policy: Option<&RetryPolicy>, mut call: F) -> Result<String, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, ActivityError>>,
{
    let no_retry = RetryPolicy::no_retry();
    let policy = policy.unwrap_or(&no_retry);
    let started = tokio::time::Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let error = match call().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        match policy.evaluate(&error, attempt, started.elapsed()) {
            RetryDecision::Retry { delay } => {
                debug!(attempt, delay_ms = %delay.as_millis(), error = %error, "retrying activity");
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp { reason } => {
                return Err(RetryExhausted {
                    error,
                    attempts: attempt,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_progress() -> ActivityError {
        ActivityError::InProgress("job running".into())
    }

    #[test]
    fn exponential_delays_double() {
        let p = RetryPolicy::new(5, Duration::from_secs(1)).with_backoff(2.0);
        let delays: Vec<u64> = (1..=5).map(|a| p.delay_for_attempt(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let p = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(matches!(
            p.evaluate(&in_progress(), 2, Duration::ZERO),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            p.evaluate(&in_progress(), 3, Duration::ZERO),
            RetryDecision::GiveUp {
                reason: GiveUpReason::AttemptsExhausted
            }
        );
    }

    #[test]
    fn single_attempt_and_never_do_not_retry() {
        let one = RetryPolicy::new(1, Duration::from_secs(1));
        assert!(matches!(
            one.evaluate(&in_progress(), 1, Duration::ZERO),
            RetryDecision::GiveUp { .. }
        ));
        let never = RetryPolicy::new(10, Duration::from_secs(1)).retry_on(RetryOn::Never);
        assert_eq!(
            never.evaluate(&in_progress(), 1, Duration::ZERO),
            RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable
            }
        );
    }

    #[test]
    fn permanent_errors_skip_transient_policy() {
        let p = RetryPolicy::new(5, Duration::from_secs(1));
        let decision = p.evaluate(&ActivityError::Permanent("bad request".into()), 1, Duration::ZERO);
        assert_eq!(
            decision,
            RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable
            }
        );
    }

    #[test]
    fn throttle_hint_overrides_backoff_and_timeout_clamps() {
        let p = RetryPolicy::new(5, Duration::from_secs(1))
            .with_backoff(2.0)
            .with_retry_timeout(Duration::from_secs(10));
        let hinted = ActivityError::throttled("429", Some(Duration::from_secs(7)));
        assert_eq!(
            p.evaluate(&hinted, 1, Duration::from_secs(1)),
            RetryDecision::Retry {
                delay: Duration::from_secs(7)
            }
        );
        assert_eq!(
            p.evaluate(&hinted, 1, Duration::from_secs(8)),
            RetryDecision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            p.evaluate(&hinted, 1, Duration::from_secs(10)),
            RetryDecision::GiveUp {
                reason: GiveUpReason::TimeoutExceeded
            }
        );
    }

    #[test]
    fn message_predicate_and_classification() {
        let p = RetryPolicy::new(3, Duration::from_secs(1))
            .retry_on(RetryOn::MessageContains("still in progress".into()));
        let err = ActivityError::from("in progress: The transcription is still in progress.");
        assert_eq!(err.kind(), FailureKind::InProgress);
        assert!(matches!(p.evaluate(&err, 1, Duration::ZERO), RetryDecision::Retry { .. }));
        assert_eq!(FailureKind::of("boom"), FailureKind::Permanent);
        assert_eq!(FailureKind::of(&ActivityError::throttled("slow", None).to_string()), FailureKind::Throttled);
    }

    #[test]
    fn capped_delay() {
        let p = RetryPolicy::new(10, Duration::from_secs(1))
            .with_backoff(3.0)
            .with_max_retry_delay(Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(4), Duration::from_secs(5));
    }
}
