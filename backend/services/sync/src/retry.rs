//! Bounded retry with exponential backoff for remote and checkpoint calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::StatusCode;
use shopmirror_common::error::MirrorError;

use crate::remote::{RemoteError, DNS_TRY_AGAIN};

const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Classifies errors for `with_retry`.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-provided wait, used instead of the computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Transient for RemoteError {
    fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            RemoteError::Network { code, .. } => code.as_deref() == Some(DNS_TRY_AGAIN),
            RemoteError::Decode(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Http { retry_after, .. } => retry_after.map(|d| d.min(MAX_RETRY_AFTER)),
            _ => None,
        }
    }
}

/// Database hiccups are retried when writing checkpoints; everything else is
/// a programming or data error.
impl Transient for MirrorError {
    fn is_transient(&self) -> bool {
        matches!(self, MirrorError::Database(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_interval: Duration::from_millis(backoff::default::INITIAL_INTERVAL_MILLIS),
            max_interval: Duration::from_millis(backoff::default::MAX_INTERVAL_MILLIS),
            multiplier: backoff::default::MULTIPLIER,
            randomization_factor: backoff::default::RANDOMIZATION_FACTOR,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `call` until it succeeds, fails permanently, or `max_retries` is used up.
///
/// The error returned is always the one produced by the last attempt, so the
/// caller sees the real cause rather than a retry-exhaustion wrapper.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.backoff();
    let mut attempt: u32 = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let wait = err
                    .retry_after()
                    .or_else(|| backoff.next_backoff())
                    .unwrap_or(policy.max_interval);
                tracing::warn!(
                    operation,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying after backoff"
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    fn too_many_requests() -> RemoteError {
        RemoteError::Http {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "slow down".to_string(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "count", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(too_many_requests())
            } else {
                Ok(600u64)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 600);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(5), "list_page", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Http {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_string(),
                retry_after: None,
            })
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "HTTP 500 Internal Server Error: boom");
    }

    #[tokio::test]
    async fn exhaustion_returns_the_original_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(2), "count", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(too_many_requests())
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            RemoteError::Http { status, .. } if status == StatusCode::TOO_MANY_REQUESTS
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dns_try_again_is_retried_but_other_network_errors_are_not() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), "count", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RemoteError::Network {
                    code: Some(DNS_TRY_AGAIN.to_string()),
                    message: "dns error".to_string(),
                })
            } else {
                Ok(1u64)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let refused = RemoteError::Network {
            code: None,
            message: "connection refused".to_string(),
        };
        assert!(!refused.is_transient());
    }

    #[tokio::test]
    async fn retry_after_header_is_capped() {
        let err = RemoteError::Http {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn database_errors_are_transient_for_checkpoints() {
        assert!(MirrorError::Database("connection reset".into()).is_transient());
        assert!(!MirrorError::NotFound("run".into()).is_transient());
    }

    #[test]
    fn default_policy_follows_backoff_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval, Duration::from_millis(500));
        assert_eq!(policy.max_interval, Duration::from_secs(60));
        assert_eq!(policy.max_retries, 10);
    }
}
