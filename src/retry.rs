//! Bounded retry for remote calls, driven by a pluggable failure classifier.
//!
//! Every call that touches the storage backend goes through [`with_retry`].
//! Whether a failure is worth another attempt is decided by a
//! [`RetryClassifier`] looking at a [`RemoteFailure`], never at a concrete
//! client library error type.

use crate::error::{IngestError, RemoteFailure};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialFactorBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// Substring of an OAuth `error_description` that marks a transient
/// assertion failure (clock skew, key rotation) rather than a bad credential.
pub const INVALID_JWT_PATTERN: &str = "Invalid JWT";

/// How often and how patiently a remote call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval_ms: u64,
    /// Upper bound for any single delay.
    pub max_interval_ms: u64,
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Scale each delay by a random factor in `[0.5, 1.5)`, still capped.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_retries: 3,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts: doubling from the initial interval, capped,
    /// and exactly `max_retries` long.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let jittered = self.jitter;
        let cap = Duration::from_millis(self.max_interval_ms);
        ExponentialFactorBackoff::from_millis(self.initial_interval_ms, 2.0)
            .max_delay(cap)
            .map(move |delay| if jittered { jitter(delay).min(cap) } else { delay })
            .take(self.max_retries as usize)
    }
}

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fatal,
}

/// Decides whether a failed remote call should be attempted again.
pub trait RetryClassifier: Send + Sync {
    fn classify(&self, failure: &RemoteFailure) -> RetryDecision;
}

impl<F> RetryClassifier for F
where
    F: Fn(&RemoteFailure) -> RetryDecision + Send + Sync,
{
    fn classify(&self, failure: &RemoteFailure) -> RetryDecision {
        self(failure)
    }
}

/// Classification rules for the storage JSON API and OAuth token endpoints.
///
/// - an `error_description` containing [`INVALID_JWT_PATTERN`] is retried
/// - 5xx is retried
/// - 4xx with structured detail is fatal; 4xx without detail but with a
///   non-empty body is retried; 4xx with nothing at all is fatal
/// - other statuses and transport failures are retried
/// - failures that did not come from the API are fatal unless
///   [`DefaultClassifier::retry_unclassified`] is enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier {
    retry_unclassified: bool,
}

impl DefaultClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whitelist failures outside the remote API (`RemoteFailure::Other`).
    pub fn retry_unclassified(mut self, retry: bool) -> Self {
        self.retry_unclassified = retry;
        self
    }
}

impl RetryClassifier for DefaultClassifier {
    fn classify(&self, failure: &RemoteFailure) -> RetryDecision {
        match failure {
            RemoteFailure::Http {
                status,
                body,
                detail,
            } => {
                let transient_auth = detail
                    .as_ref()
                    .and_then(|d| d.description.as_deref())
                    .is_some_and(|d| d.contains(INVALID_JWT_PATTERN));
                if transient_auth || status / 100 == 5 {
                    return RetryDecision::Retry;
                }
                if status / 100 != 4 {
                    return RetryDecision::Retry;
                }
                if detail.is_none() && body.as_deref().is_some_and(|b| !b.is_empty()) {
                    RetryDecision::Retry
                } else {
                    RetryDecision::Fatal
                }
            }
            RemoteFailure::Transport(_) => RetryDecision::Retry,
            RemoteFailure::Other(_) if self.retry_unclassified => RetryDecision::Retry,
            RemoteFailure::Other(_) => RetryDecision::Fatal,
        }
    }
}

/// Runs `call` until it succeeds, fails fatally, or the policy is exhausted.
///
/// Both a fatal failure and the failure left after the last retry are
/// returned as [`IngestError::GiveUp`], whose source is the original
/// [`RemoteFailure`].
///
/// # Arguments
///
/// * `policy` - Delays and retry bound
/// * `classifier` - Decides retry vs. fatal per failure
/// * `operation` - Name used in logs and in the give-up error
/// * `call` - Produces one attempt per invocation
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    classifier: &dyn RetryClassifier,
    operation: &str,
    mut call: F,
) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteFailure>>,
{
    let attempts = AtomicU32::new(0);
    let max_attempts = policy.max_retries.saturating_add(1);

    let result = Retry::spawn(policy.delays(), || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = call();
        async move {
            match pending.await {
                Ok(value) => Ok(value),
                Err(failure) => match classifier.classify(&failure) {
                    RetryDecision::Retry => {
                        if attempt < max_attempts {
                            warn!(
                                operation,
                                attempt,
                                max_attempts,
                                error = %failure,
                                "Retryable error, backing off"
                            );
                        }
                        RetryError::to_transient(failure)
                    }
                    RetryDecision::Fatal => {
                        debug!(operation, attempt, error = %failure, "Non-retryable error");
                        RetryError::to_permanent(failure)
                    }
                },
            }
        }
    })
    .await;

    result.map_err(|source| IngestError::GiveUp {
        operation: operation.to_string(),
        attempts: attempts.load(Ordering::SeqCst),
        source,
    })
}
